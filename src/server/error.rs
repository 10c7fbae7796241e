// src/server/error.rs
// HTTP error responses for the REST surface

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

use crate::error::NotifierError;

#[derive(Debug)]
pub struct ApiError {
    pub message: String,
    pub status_code: StatusCode,
    pub error_code: Option<String>,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: Some("INTERNAL_ERROR".to_string()),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
            error_code: Some("BAD_REQUEST".to_string()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
            error_code: Some("NOT_FOUND".to_string()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<NotifierError> for ApiError {
    fn from(err: NotifierError) -> Self {
        if !err.is_client_error() {
            error!(error = %err, "Request failed");
            return ApiError::internal("Internal error");
        }
        match err {
            NotifierError::Validation(message) => ApiError::bad_request(message),
            other => ApiError::not_found(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": true,
            "message": self.message,
            "status": self.status_code.as_u16()
        });

        if let Some(error_code) = self.error_code {
            body["error_code"] = json!(error_code);
        }

        (self.status_code, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(ApiError::from(NotifierError::NotFound(3)).status_code, StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(NotifierError::validation("no ids")).status_code,
            StatusCode::BAD_REQUEST
        );
        let internal = ApiError::from(NotifierError::Config("db path".into()));
        assert_eq!(internal.status_code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.message, "Internal error");
    }
}
