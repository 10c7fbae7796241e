// src/watcher.rs
// Ingestion pipeline: tail -> parse -> store -> notify, plus its schedulers

use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::NotifierConfig;
use crate::error::NotifierResult;
use crate::notify::{NotificationDispatcher, PushSender, RateLimiter};
use crate::parser::{EntryParser, LogLevel, ParsedEntry};
use crate::store::{ErrorRecord, ErrorStore, StoreOptions, StoreOutcome};
use crate::stream::RecentErrors;
use crate::tailer::{FileTailer, LogSource, SqlitePositionStore, TailChunk};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct LogWatcher {
    enabled: bool,
    levels: Vec<LogLevel>,
    retention_days: i64,
    source: LogSource,
    parser: Arc<EntryParser>,
    tailer: FileTailer,
    store: ErrorStore,
    dispatcher: NotificationDispatcher,
    recent: Arc<RecentErrors>,
}

impl LogWatcher {
    pub fn new(
        config: &NotifierConfig,
        parser: Arc<EntryParser>,
        tailer: FileTailer,
        store: ErrorStore,
        dispatcher: NotificationDispatcher,
        recent: Arc<RecentErrors>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            levels: config.levels.clone(),
            retention_days: config.retention_days,
            source: LogSource::from_config(&config.logs),
            parser,
            tailer,
            store,
            dispatcher,
            recent,
        }
    }

    /// Wire the full pipeline over one SQLite pool
    pub fn from_config(
        config: &NotifierConfig,
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn PushSender>,
    ) -> NotifierResult<Self> {
        let parser = Arc::new(EntryParser::from_config(&config.masking)?);
        let positions = Arc::new(SqlitePositionStore::new(pool.clone(), clock.clone()));
        let store = ErrorStore::new(pool, StoreOptions::from_config(config), clock.clone());
        let dispatcher = NotificationDispatcher::new(
            RateLimiter::new(&config.rate_limit, clock),
            sender,
            config.notification.clone(),
        );
        let recent = Arc::new(RecentErrors::new(config.stream.recent_capacity));

        Ok(Self::new(
            config,
            parser,
            FileTailer::new(positions),
            store,
            dispatcher,
            recent,
        ))
    }

    pub fn store(&self) -> &ErrorStore {
        &self.store
    }

    pub fn parser(&self) -> &Arc<EntryParser> {
        &self.parser
    }

    pub fn recent(&self) -> &Arc<RecentErrors> {
        &self.recent
    }

    pub fn source(&self) -> &LogSource {
        &self.source
    }

    pub fn levels(&self) -> &[LogLevel] {
        &self.levels
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// One ingestion pass over every configured file. Returns the records
    /// created by this pass, ascending by id. A file whose entries could not
    /// all be stored keeps its old offset and is retried next pass.
    pub async fn watch(&self) -> Vec<ErrorRecord> {
        if !self.enabled {
            return Vec::new();
        }

        let paths = self.source.discover();
        let mut created = Vec::new();

        for chunk in self.tailer.tail(&paths).await {
            let path = chunk.path.clone();
            match self.process_chunk(&chunk).await {
                Ok(records) => {
                    if let Err(e) = self.tailer.commit(chunk).await {
                        warn!(path = %path.display(), error = %e, "Failed to commit log offset");
                    }
                    created.extend(records);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to store log entries, will retry");
                }
            }
        }

        if let Some(dir) = self.source.directory() {
            if let Err(e) = self.tailer.forget_missing(dir).await {
                debug!(error = %e, "Position cleanup failed");
            }
        }

        created.sort_by_key(|r| r.id);
        if !created.is_empty() {
            info!(files = paths.len(), new_errors = created.len(), "Log watch pass stored new errors");
        }
        created
    }

    async fn process_chunk(&self, chunk: &TailChunk) -> NotifierResult<Vec<ErrorRecord>> {
        let entries = self.parser.parse(&chunk.content, &self.levels);
        debug!(
            path = %chunk.path.display(),
            bytes = chunk.end - chunk.start,
            entries = entries.len(),
            "Parsed log chunk"
        );

        let mut created = Vec::new();
        for entry in &entries {
            let outcome = self.ingest(entry).await?;
            if outcome.is_new {
                created.push(outcome.record);
            }
        }
        Ok(created)
    }

    /// Store one entry from any producer. New records are published to the
    /// recent buffer and announced; merged repeats only refresh the buffer.
    pub async fn ingest(&self, entry: &ParsedEntry) -> NotifierResult<StoreOutcome> {
        let outcome = self.store.store(entry).await?;
        self.recent.push(outcome.record.clone());
        if outcome.is_new {
            self.dispatcher.dispatch(&outcome.record).await;
        }
        Ok(outcome)
    }

    /// Forget every tracked offset so the next pass re-reads all files
    pub async fn reset_positions(&self) -> NotifierResult<u64> {
        let cleared = self.tailer.reset(&[]).await?;
        info!(cleared, "Reset log positions");
        Ok(cleared)
    }

    pub async fn sweep_retention(&self) -> NotifierResult<u64> {
        let purged = self.store.purge_older_than(self.retention_days).await?;
        if purged > 0 {
            info!(purged, retention_days = self.retention_days, "Purged expired error records");
        }
        Ok(purged)
    }

    /// Periodic `watch()` plus an hourly retention sweep
    pub fn spawn_scheduler(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut watch_tick = interval(every);
            watch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sweep_tick = interval(RETENTION_SWEEP_INTERVAL);
            sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(interval_secs = every.as_secs(), "Log watcher scheduler started");
            loop {
                tokio::select! {
                    _ = watch_tick.tick() => {
                        self.watch().await;
                    }
                    _ = sweep_tick.tick() => {
                        if let Err(e) = self.sweep_retention().await {
                            warn!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }
        })
    }

    /// Drain directly captured errors into the store
    pub fn spawn_capture_worker(self: Arc<Self>, mut rx: mpsc::Receiver<ParsedEntry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = self.ingest(&entry).await {
                    warn!(error = %e, "Failed to store captured error");
                }
            }
            debug!("Capture channel closed");
        })
    }
}
