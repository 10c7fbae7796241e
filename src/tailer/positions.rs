// src/tailer/positions.rs
// Durable per-file read offsets

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::{Clock, to_millis};
use crate::error::NotifierResult;

/// Where each tailed file has been consumed up to. Offsets survive restarts
/// only as well as the backing store does.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Offset for `path`, 0 when never seen
    async fn get(&self, path: &Path) -> NotifierResult<u64>;
    async fn set(&self, path: &Path, offset: u64) -> NotifierResult<()>;
    async fn remove(&self, path: &Path) -> NotifierResult<()>;
    /// Forget the given paths, or every path when the slice is empty
    async fn clear(&self, paths: &[PathBuf]) -> NotifierResult<u64>;
    async fn known_paths(&self) -> NotifierResult<Vec<PathBuf>>;
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub struct SqlitePositionStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqlitePositionStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn get(&self, path: &Path) -> NotifierResult<u64> {
        let offset: Option<i64> =
            sqlx::query_scalar("SELECT byte_offset FROM file_positions WHERE file_path = ?")
                .bind(key(path))
                .fetch_optional(&self.pool)
                .await?;
        Ok(offset.and_then(|o| u64::try_from(o).ok()).unwrap_or(0))
    }

    async fn set(&self, path: &Path, offset: u64) -> NotifierResult<()> {
        sqlx::query(
            r#"
            INSERT INTO file_positions (file_path, byte_offset, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                byte_offset = excluded.byte_offset,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key(path))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(to_millis(self.clock.now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> NotifierResult<()> {
        sqlx::query("DELETE FROM file_positions WHERE file_path = ?")
            .bind(key(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self, paths: &[PathBuf]) -> NotifierResult<u64> {
        if paths.is_empty() {
            let result = sqlx::query("DELETE FROM file_positions")
                .execute(&self.pool)
                .await?;
            return Ok(result.rows_affected());
        }

        let mut removed = 0;
        for path in paths {
            removed += sqlx::query("DELETE FROM file_positions WHERE file_path = ?")
                .bind(key(path))
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(removed)
    }

    async fn known_paths(&self) -> NotifierResult<Vec<PathBuf>> {
        let paths: Vec<String> =
            sqlx::query_scalar("SELECT file_path FROM file_positions ORDER BY file_path")
                .fetch_all(&self.pool)
                .await?;
        Ok(paths.into_iter().map(PathBuf::from).collect())
    }
}

/// Process-local positions, lost on restart
#[derive(Default)]
pub struct MemoryPositionStore {
    offsets: RwLock<HashMap<PathBuf, u64>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn get(&self, path: &Path) -> NotifierResult<u64> {
        Ok(self.offsets.read().await.get(path).copied().unwrap_or(0))
    }

    async fn set(&self, path: &Path, offset: u64) -> NotifierResult<()> {
        self.offsets.write().await.insert(path.to_path_buf(), offset);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> NotifierResult<()> {
        self.offsets.write().await.remove(path);
        Ok(())
    }

    async fn clear(&self, paths: &[PathBuf]) -> NotifierResult<u64> {
        let mut offsets = self.offsets.write().await;
        if paths.is_empty() {
            let removed = offsets.len() as u64;
            offsets.clear();
            return Ok(removed);
        }
        Ok(paths.iter().filter(|p| offsets.remove(*p).is_some()).count() as u64)
    }

    async fn known_paths(&self) -> NotifierResult<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = self.offsets.read().await.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::memory_pool;

    async fn exercise(store: &dyn PositionStore) {
        let a = Path::new("/var/log/app/a.log");
        let b = Path::new("/var/log/app/b.log");

        assert_eq!(store.get(a).await.unwrap(), 0);
        store.set(a, 120).await.unwrap();
        store.set(a, 240).await.unwrap();
        store.set(b, 10).await.unwrap();
        assert_eq!(store.get(a).await.unwrap(), 240);
        assert_eq!(store.known_paths().await.unwrap(), vec![a.to_path_buf(), b.to_path_buf()]);

        assert_eq!(store.clear(&[b.to_path_buf()]).await.unwrap(), 1);
        assert_eq!(store.get(b).await.unwrap(), 0);

        store.remove(a).await.unwrap();
        assert!(store.known_paths().await.unwrap().is_empty());

        store.set(a, 1).await.unwrap();
        store.set(b, 2).await.unwrap();
        assert_eq!(store.clear(&[]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_positions() {
        let pool = memory_pool().await.unwrap();
        let store = SqlitePositionStore::new(pool, Arc::new(SystemClock));
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_memory_positions() {
        exercise(&MemoryPositionStore::new()).await;
    }
}
