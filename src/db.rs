//! Database pool configuration and migrations

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{NotifierError, NotifierResult};

/// Create the SQLite pool backing the error store and position tracker
pub async fn connect(database_url: &str) -> NotifierResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| NotifierError::Config(format!("invalid database url {database_url}: {e}")))?
        .create_if_missing(true)
        // Tailer sweeps and stream readers run concurrently
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        // SQLite is single-writer, but can have multiple readers
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600)) // 10 minutes
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Apply the embedded migrations
pub async fn migrate(pool: &SqlitePool) -> NotifierResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Migrations complete");
    Ok(())
}

/// Single-connection in-memory database, migrated. Every connection to
/// `sqlite::memory:` is its own database, so the pool must never grow or
/// recycle its connection.
pub async fn memory_pool() -> NotifierResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pool_has_schema() {
        let pool = memory_pool().await.unwrap();
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('error_records', 'file_positions')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let err = connect("sqlite:errors.db?bogus=1").await.unwrap_err();
        assert!(matches!(err, NotifierError::Config(_)));
    }
}
