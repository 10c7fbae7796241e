// tests/common/mod.rs
// Shared harness: temp log directory, in-memory store, manual clock

#![allow(dead_code)]

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

use log_notifier::db::memory_pool;
use log_notifier::notify::{Notification, PushSender};
use log_notifier::{Clock, LogWatcher, ManualClock, NotifierConfig};

/// Counts sends instead of delivering them
#[derive(Default)]
pub struct CountingSender {
    sent: AtomicUsize,
}

impl CountingSender {
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushSender for CountingSender {
    async fn send(&self, _notification: &Notification) -> anyhow::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: NotifierConfig,
    pub clock: Arc<ManualClock>,
    pub sender: Arc<CountingSender>,
    pub watcher: Arc<LogWatcher>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Logs go to a fresh temp directory scanned in directory mode
    pub async fn with_config(adjust: impl FnOnce(&mut NotifierConfig)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = NotifierConfig::default();
        config.logs.path = dir.path().to_path_buf();
        adjust(&mut config);

        let clock = Arc::new(ManualClock::default());
        let sender = Arc::new(CountingSender::default());
        let pool = memory_pool().await.expect("memory pool");
        let watcher = LogWatcher::from_config(&config, pool, clock.clone(), sender.clone())
            .expect("watcher");

        Self {
            dir,
            config,
            clock,
            sender,
            watcher: Arc::new(watcher),
        }
    }

    pub fn append(&self, file: &str, text: &str) {
        let mut handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.path().join(file))
            .expect("open log file");
        handle.write_all(text.as_bytes()).expect("append log text");
    }

    pub fn overwrite(&self, file: &str, text: &str) {
        std::fs::write(self.dir.path().join(file), text).expect("overwrite log file");
    }

    /// One log entry stamped with the harness clock's current time
    pub fn entry(&self, level: &str, message: &str) -> String {
        let now = self.clock.now().format("%Y-%m-%d %H:%M:%S").to_string();
        entry_at(&now, level, message)
    }
}

/// One log entry in the `[timestamp] env.LEVEL: message` grammar
pub fn entry_at(timestamp: &str, level: &str, message: &str) -> String {
    format!("[{timestamp}] production.{level}: {message}\n")
}
