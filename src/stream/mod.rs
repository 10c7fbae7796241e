//! Live error stream
//!
//! Each client connection is a bounded session:
//!
//! ```text
//! CONNECTING --ack--> OPEN --tick--> (IDLE <-> EMITTING) --deadline--> CLOSED
//! ```
//!
//! A session remembers the highest id it has delivered and, on every tick,
//! emits anything newer in ascending id order. Idle sessions send heartbeats.
//! After the session duration an explicit close frame is sent and the client
//! reconnects with the last id it saw. Delivery is at-least-once; clients
//! dedupe by id.

pub mod recent;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::error::NotifierResult;
use crate::parser::truncate_chars;
use crate::store::{ErrorRecord, ErrorStore};
pub use recent::RecentErrors;

const TRACE_EXCERPT_CHARS: usize = 200;

/// Anything that can serve records by id cursor
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Records with `id > cursor`, ascending, at most `limit`
    async fn records_after(&self, cursor: i64, limit: usize) -> NotifierResult<Vec<ErrorRecord>>;
    /// Highest id available, 0 when none
    async fn latest_id(&self) -> NotifierResult<i64>;
}

#[async_trait]
impl RecordSource for ErrorStore {
    async fn records_after(&self, cursor: i64, limit: usize) -> NotifierResult<Vec<ErrorRecord>> {
        ErrorStore::records_after(self, cursor, limit).await
    }

    async fn latest_id(&self) -> NotifierResult<i64> {
        ErrorStore::latest_id(self).await
    }
}

/// JSON body of one record frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamPayload {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub trace: String,
    pub file: String,
    pub line: u32,
    pub environment: String,
    pub occurrence_count: i64,
    pub occurred_at: String,
    pub source: String,
}

impl From<&ErrorRecord> for StreamPayload {
    fn from(record: &ErrorRecord) -> Self {
        let mut trace = record.trace.clone().unwrap_or_default();
        if trace.chars().count() > TRACE_EXCERPT_CHARS {
            truncate_chars(&mut trace, TRACE_EXCERPT_CHARS);
            trace.push_str("...");
        }
        Self {
            id: record.id,
            level: record.level.as_str().to_string(),
            message: record.message.clone(),
            trace,
            file: record.file.clone(),
            line: record.line,
            environment: record.environment.clone(),
            occurrence_count: record.occurrence_count,
            occurred_at: record.last_occurred_at.to_rfc3339(),
            source: record.source.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Non-data comment; the first frame of every session
    Comment(String),
    /// A record, tagged with its id as the resumption token
    Record { id: i64, payload: StreamPayload },
    Heartbeat,
    /// Terminal frame; the client should reconnect
    Close { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub session: Duration,
    pub heartbeat: Duration,
    pub poll: Duration,
    pub batch_size: usize,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            session: config.session(),
            heartbeat: config.heartbeat(),
            poll: config.poll(),
            batch_size: config.batch_size.max(1),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Per-connection cursor state
pub struct Session {
    source: Arc<dyn RecordSource>,
    settings: StreamSettings,
    /// Highest id delivered. `None` until the starting watermark could be read.
    high_water: Option<i64>,
    last_beat: Instant,
    deadline: Instant,
    state: SessionState,
}

impl Session {
    pub fn new(source: Arc<dyn RecordSource>, settings: StreamSettings) -> Self {
        let now = Instant::now();
        Self {
            source,
            settings,
            high_water: None,
            last_beat: now,
            deadline: now + settings.session,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn high_water(&self) -> Option<i64> {
        self.high_water
    }

    /// Fix the starting watermark.
    ///
    /// Cursor 0 starts at the newest existing id, so no history is replayed.
    /// A non-zero cursor is honored, clamped to the newest id so a reset
    /// store does not leave the client waiting on ids that will not come.
    pub async fn open(&mut self, last_event_id: i64) {
        let latest = match self.source.latest_id().await {
            Ok(latest) => Some(latest),
            Err(e) => {
                debug!(error = %e, "Could not read stream watermark, deferring");
                None
            }
        };

        self.high_water = match (last_event_id, latest) {
            (0, latest) => latest,
            (cursor, Some(latest)) => Some(cursor.min(latest).max(0)),
            (cursor, None) => Some(cursor),
        };
        self.state = SessionState::Open;
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// One poll: emit what is new, or a heartbeat when idle long enough.
    /// A failing source is treated as having nothing new.
    pub async fn tick(&mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();

        match self.high_water {
            None => {
                if let Ok(latest) = self.source.latest_id().await {
                    self.high_water = Some(latest);
                }
            }
            Some(cursor) => match self.source.records_after(cursor, self.settings.batch_size).await {
                Ok(records) => {
                    for record in records.iter().filter(|r| r.id > cursor) {
                        self.high_water = Some(record.id);
                        frames.push(StreamFrame::Record {
                            id: record.id,
                            payload: StreamPayload::from(record),
                        });
                    }
                }
                Err(e) => debug!(error = %e, "Stream tick skipped"),
            },
        }

        if !frames.is_empty() {
            trace!(count = frames.len(), high_water = ?self.high_water, "Emitting records");
            self.last_beat = Instant::now();
        } else if self.last_beat.elapsed() >= self.settings.heartbeat {
            frames.push(StreamFrame::Heartbeat);
            self.last_beat = Instant::now();
        }
        frames
    }

    pub fn close(&mut self) -> StreamFrame {
        self.state = SessionState::Closed;
        StreamFrame::Close {
            reason: "Connection timeout".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct LiveStreamBroker {
    source: Arc<dyn RecordSource>,
    settings: StreamSettings,
}

impl LiveStreamBroker {
    pub fn new(source: Arc<dyn RecordSource>, settings: StreamSettings) -> Self {
        Self { source, settings }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Run one bounded session. Dropping the stream ends it immediately.
    pub fn open(&self, last_event_id: i64) -> impl Stream<Item = StreamFrame> + Send + use<> {
        let source = self.source.clone();
        let settings = self.settings;

        async_stream::stream! {
            let mut session = Session::new(source, settings);
            yield StreamFrame::Comment("Connected".to_string());
            session.open(last_event_id).await;
            debug!(last_event_id, high_water = ?session.high_water(), "Stream session opened");

            let mut ticker = tokio::time::interval(settings.poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            while !session.expired() {
                ticker.tick().await;
                for frame in session.tick().await {
                    yield frame;
                }
            }

            yield session.close();
        }
    }
}
