// src/tailer/mod.rs
// Incremental reader for growing log files

pub mod positions;

use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::LogsConfig;
use crate::error::NotifierResult;
pub use positions::{MemoryPositionStore, PositionStore, SqlitePositionStore};

/// Which files one ingestion pass looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    /// Exactly this file
    File(PathBuf),
    /// Every file with `extension` directly inside `path`, re-listed each pass
    Directory { path: PathBuf, extension: String },
}

impl LogSource {
    pub fn from_config(config: &LogsConfig) -> Self {
        if config.scan_all {
            LogSource::Directory {
                path: config.path.clone(),
                extension: config.extension.trim_start_matches('.').to_string(),
            }
        } else {
            LogSource::File(config.path.clone())
        }
    }

    /// Files to tail right now, sorted. Missing paths yield nothing.
    pub fn discover(&self) -> Vec<PathBuf> {
        match self {
            LogSource::File(path) => {
                if path.is_file() {
                    vec![path.clone()]
                } else {
                    Vec::new()
                }
            }
            LogSource::Directory { path, extension } => {
                if !path.is_dir() {
                    debug!(path = %path.display(), "Log directory does not exist");
                    return Vec::new();
                }
                let mut files: Vec<PathBuf> = WalkDir::new(path)
                    .max_depth(1)
                    .follow_links(true)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path())
                    .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(extension.as_str()))
                    .collect();
                files.sort();
                files
            }
        }
    }

    /// Directory being scanned, if any
    pub fn directory(&self) -> Option<&Path> {
        match self {
            LogSource::Directory { path, .. } => Some(path),
            LogSource::File(_) => None,
        }
    }
}

/// Bytes appended to one file since its committed offset.
///
/// Holds the file's lock until committed or dropped, so no other read of the
/// same file can interleave. Dropping without `commit` leaves the offset
/// untouched and the bytes are delivered again next pass.
#[derive(Debug)]
pub struct TailChunk {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
    pub content: String,
    _guard: OwnedMutexGuard<()>,
}

pub struct FileTailer {
    positions: Arc<dyn PositionStore>,
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl FileTailer {
    pub fn new(positions: Arc<dyn PositionStore>) -> Self {
        Self {
            positions,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn positions(&self) -> &Arc<dyn PositionStore> {
        &self.positions
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Read `[offset, size)` of `path`.
    ///
    /// Returns `None` when the file is gone or has not grown. A file smaller
    /// than its offset has been rotated or truncated and is read from 0.
    pub async fn read_new(&self, path: &Path) -> NotifierResult<Option<TailChunk>> {
        let guard = self.lock_for(path).lock_owned().await;

        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Log file vanished, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let mut offset = self.positions.get(path).await?;

        if size < offset {
            warn!(
                path = %path.display(),
                size,
                offset,
                "Log file shrank below tracked offset, treating as rotated"
            );
            self.positions.set(path, 0).await?;
            offset = 0;
        }

        if size <= offset {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut bytes = Vec::with_capacity(usize::try_from(size - offset).unwrap_or(0));
        file.take(size - offset).read_to_end(&mut bytes).await?;
        bytes.truncate(complete_utf8_len(&bytes));
        if bytes.is_empty() {
            return Ok(None);
        }
        let end = offset + bytes.len() as u64;

        debug!(path = %path.display(), start = offset, end, "Read appended bytes");
        Ok(Some(TailChunk {
            path: path.to_path_buf(),
            start: offset,
            end,
            content: String::from_utf8_lossy(&bytes).into_owned(),
            _guard: guard,
        }))
    }

    /// Persist the chunk's end offset, releasing the file lock
    pub async fn commit(&self, chunk: TailChunk) -> NotifierResult<()> {
        self.positions.set(&chunk.path, chunk.end).await
    }

    /// One read window per file, files processed concurrently. Unreadable
    /// files are logged and skipped.
    pub async fn tail(&self, paths: &[PathBuf]) -> Vec<TailChunk> {
        let reads = paths.iter().map(|path| async move {
            match self.read_new(path).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read log file");
                    None
                }
            }
        });
        join_all(reads).await.into_iter().flatten().collect()
    }

    /// Forget offsets for `paths` (all known paths when empty), forcing a
    /// full re-read on the next pass
    pub async fn reset(&self, paths: &[PathBuf]) -> NotifierResult<u64> {
        self.positions.clear(paths).await
    }

    /// Drop offsets of files under `dir` that no longer exist
    pub async fn forget_missing(&self, dir: &Path) -> NotifierResult<u64> {
        let mut forgotten = 0;
        for path in self.positions.known_paths().await? {
            if path.starts_with(dir) && !path.exists() {
                self.positions.remove(&path).await?;
                self.locks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&path);
                forgotten += 1;
            }
        }
        if forgotten > 0 {
            debug!(dir = %dir.display(), forgotten, "Forgot positions of deleted log files");
        }
        Ok(forgotten)
    }
}

/// Length of `bytes` without a trailing, not yet complete UTF-8 sequence.
/// A writer caught mid-character finishes it before the next pass.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if back < needed { len - back } else { len };
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn tailer() -> FileTailer {
        FileTailer::new(Arc::new(MemoryPositionStore::new()))
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_reads_only_appended_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "first\n");

        let tailer = tailer();
        let chunk = tailer.read_new(&path).await.unwrap().unwrap();
        assert_eq!(chunk.content, "first\n");
        assert_eq!((chunk.start, chunk.end), (0, 6));
        tailer.commit(chunk).await.unwrap();

        assert!(tailer.read_new(&path).await.unwrap().is_none());

        append(&path, "second\n");
        let chunk = tailer.read_new(&path).await.unwrap().unwrap();
        assert_eq!(chunk.content, "second\n");
        assert_eq!(chunk.start, 6);
    }

    #[tokio::test]
    async fn test_split_multibyte_character_waits_for_completion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"caf\xC3").unwrap();

        let tailer = tailer();
        let chunk = tailer.read_new(&path).await.unwrap().unwrap();
        assert_eq!(chunk.content, "caf");
        assert_eq!(chunk.end, 3);
        tailer.commit(chunk).await.unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\xA9 ouvert\n").unwrap();
        let chunk = tailer.read_new(&path).await.unwrap().unwrap();
        assert_eq!(chunk.content, "é ouvert\n");
        assert_eq!(chunk.start, 3);
    }

    #[tokio::test]
    async fn test_only_partial_character_reads_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"\xE2\x82").unwrap();
        assert!(tailer().read_new(&path).await.unwrap().is_none());
    }

    #[test]
    fn test_complete_utf8_len() {
        assert_eq!(complete_utf8_len(b"abc"), 3);
        assert_eq!(complete_utf8_len("é".as_bytes()), 2);
        assert_eq!(complete_utf8_len(b"a\xE2\x82"), 1);
        assert_eq!(complete_utf8_len(b"a\xF0\x9F\x98"), 1);
        assert_eq!(complete_utf8_len("a😀".as_bytes()), 5);
        assert_eq!(complete_utf8_len(b""), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_chunk_is_redelivered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "line\n");

        let tailer = tailer();
        drop(tailer.read_new(&path).await.unwrap().unwrap());
        let again = tailer.read_new(&path).await.unwrap().unwrap();
        assert_eq!(again.content, "line\n");
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a long line before rotation\n");

        let tailer = tailer();
        let chunk = tailer.read_new(&path).await.unwrap().unwrap();
        tailer.commit(chunk).await.unwrap();

        std::fs::write(&path, "fresh\n").unwrap();
        let chunk = tailer.read_new(&path).await.unwrap().unwrap();
        assert_eq!(chunk.start, 0);
        assert_eq!(chunk.content, "fresh\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let tailer = tailer();
        assert!(tailer.read_new(&dir.path().join("gone.log")).await.unwrap().is_none());
        assert!(tailer.tail(&[dir.path().join("gone.log")]).await.is_empty());
    }

    #[tokio::test]
    async fn test_reads_of_one_file_are_serialized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "once\n");

        let tailer = Arc::new(tailer());
        let chunk = tailer.read_new(&path).await.unwrap().unwrap();

        let other = {
            let tailer = tailer.clone();
            let path = path.clone();
            tokio::spawn(async move { tailer.read_new(&path).await.unwrap().map(|c| c.content) })
        };
        tokio::task::yield_now().await;
        tailer.commit(chunk).await.unwrap();

        assert_eq!(other.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_forces_full_reread() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "content\n");

        let tailer = tailer();
        let chunk = tailer.read_new(&path).await.unwrap().unwrap();
        tailer.commit(chunk).await.unwrap();
        assert_eq!(tailer.reset(&[]).await.unwrap(), 1);

        let chunk = tailer.read_new(&path).await.unwrap().unwrap();
        assert_eq!(chunk.content, "content\n");
    }

    #[tokio::test]
    async fn test_forget_missing() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("kept.log");
        let removed = dir.path().join("removed.log");
        append(&kept, "x\n");
        append(&removed, "y\n");

        let tailer = tailer();
        for chunk in tailer.tail(&[kept.clone(), removed.clone()]).await {
            tailer.commit(chunk).await.unwrap();
        }
        std::fs::remove_file(&removed).unwrap();

        assert_eq!(tailer.forget_missing(dir.path()).await.unwrap(), 1);
        assert_eq!(tailer.positions().known_paths().await.unwrap(), vec![kept]);
    }

    #[test]
    fn test_directory_discovery_filters_extension() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.log"), "").unwrap();
        std::fs::write(dir.path().join("a.log"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c.log"), "").unwrap();

        let source = LogSource::from_config(&LogsConfig {
            path: dir.path().to_path_buf(),
            scan_all: true,
            extension: ".log".into(),
        });
        let names: Vec<String> = source
            .discover()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.log", "b.log"]);
    }

    #[test]
    fn test_single_file_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let source = LogSource::File(path.clone());
        assert!(source.discover().is_empty());
        std::fs::write(&path, "").unwrap();
        assert_eq!(source.discover(), vec![path]);
        assert!(source.directory().is_none());
    }
}
