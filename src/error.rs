// src/error.rs
// Error type shared by the ingestion pipeline and the operator operations

/// Errors surfaced by the core library
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("Error record {0} not found")]
    NotFound(i64),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid mask pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl NotifierError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for failures an operator caused (bad id, bad input), as opposed
    /// to infrastructure failures
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Validation(_))
    }
}

pub type NotifierResult<T> = Result<T, NotifierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = NotifierError::NotFound(42);
        assert_eq!(err.to_string(), "Error record 42 not found");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_io_is_not_client_error() {
        let err: NotifierError = std::io::Error::other("disk gone").into();
        assert!(!err.is_client_error());
    }
}
