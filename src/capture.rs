//! Direct error capture
//!
//! Producers that bypass log tailing: panics, error values handed over by the
//! host, formatted log lines, and ERROR events from the host's own `tracing`
//! pipeline. All of them feed a bounded channel drained by the watcher into
//! the same `store()` path as tailed entries.
//!
//! Capturing never fails and never panics outward. A full or closed channel
//! simply drops the entry.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::parser::{EntryParser, ErrorSource, LogLevel, ParsedEntry, RequestData};

/// Events from these targets are never captured, so the pipeline's own
/// logging cannot feed back into itself
const OWN_TARGET: &str = "log_notifier";

/// Error metadata gathered at the point of failure
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedException {
    pub message: String,
    pub level: LogLevel,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub trace: Option<String>,
    /// When unset, the store stamps the occurrence with its own clock
    pub occurred_at: Option<DateTime<Utc>>,
    pub request: Option<RequestData>,
    pub context: Option<Value>,
}

impl CapturedException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: LogLevel::Error,
            file: None,
            line: None,
            trace: None,
            occurred_at: None,
            request: None,
            context: None,
        }
    }

    /// Message from `Display`, trace from the `source()` chain
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(format!("#{} Caused by: {cause}", causes.len()));
            source = cause.source();
        }

        let mut captured = Self::new(error.to_string());
        if !causes.is_empty() {
            captured.trace = Some(causes.join("\n"));
        }
        captured
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn occurred(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn with_request(mut self, request: RequestData) -> Self {
        self.request = Some(request);
        self
    }

    fn into_entry(self, source: ErrorSource) -> ParsedEntry {
        ParsedEntry {
            level: self.level,
            message: self.message,
            trace: self.trace,
            file: self.file,
            line: self.line,
            environment: None,
            context: self.context,
            logged_at: self.occurred_at,
            source,
            request: self.request,
        }
    }
}

/// Cheap, cloneable handle for handing errors to the ingestion pipeline
#[derive(Clone)]
pub struct ExceptionCapture {
    tx: mpsc::Sender<ParsedEntry>,
    parser: Arc<EntryParser>,
    levels: Arc<[LogLevel]>,
    enabled: bool,
}

impl ExceptionCapture {
    /// Create a capture handle and the receiver the watcher drains
    pub fn channel(
        parser: Arc<EntryParser>,
        levels: &[LogLevel],
        enabled: bool,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ParsedEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let capture = Self {
            tx,
            parser,
            levels: levels.into(),
            enabled,
        };
        (capture, rx)
    }

    pub fn is_monitored(&self, level: LogLevel) -> bool {
        self.levels.contains(&level)
    }

    /// Best-effort hand-off of one exception. Returns whether it was queued.
    pub fn capture(&self, exception: CapturedException) -> bool {
        self.submit(exception, ErrorSource::Exception)
    }

    pub fn capture_error(&self, error: &(dyn StdError + 'static)) -> bool {
        self.capture(CapturedException::from_error(error))
    }

    /// Classify one formatted log line and queue it if monitored
    pub fn capture_line(&self, line: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let queued = panic::catch_unwind(AssertUnwindSafe(|| {
            match self.parser.parse_line(line, &self.levels) {
                Some(mut entry) => {
                    entry.source = ErrorSource::Event;
                    self.tx.try_send(entry).is_ok()
                }
                None => false,
            }
        }));
        queued.unwrap_or(false)
    }

    fn submit(&self, exception: CapturedException, source: ErrorSource) -> bool {
        if !self.enabled {
            return false;
        }
        let queued = panic::catch_unwind(AssertUnwindSafe(|| {
            let entry = self.parser.sanitize(exception.into_entry(source));
            self.tx.try_send(entry).is_ok()
        }));
        queued.unwrap_or(false)
    }

    /// Capture every panic, then run the previously installed hook
    pub fn install_panic_hook(&self) {
        let capture = self.clone();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
            capture.capture(captured_panic(info));
            previous(info);
        }));
    }

    /// `tracing` layer forwarding the host's monitored events here
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer {
            capture: self.clone(),
        }
    }
}

fn captured_panic(info: &PanicHookInfo<'_>) -> CapturedException {
    let payload = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Box<dyn Any>".to_string());

    let mut captured = CapturedException::new(format!("panic: {payload}"));
    if let Some(location) = info.location() {
        captured = captured.at(location.file(), location.line());
    }
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        captured.trace = Some(backtrace.to_string());
    }
    captured
}

// ============================================================================
// tracing layer
// ============================================================================

/// Forwards `tracing` events at monitored levels into `ExceptionCapture`
#[derive(Clone)]
pub struct CaptureLayer {
    capture: ExceptionCapture,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(OWN_TARGET) {
            return;
        }
        let level = level_of(metadata.level());
        if !self.capture.is_monitored(level) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut captured = CapturedException::new(
            visitor
                .message
                .unwrap_or_else(|| metadata.name().to_string()),
        )
        .with_level(level);
        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            captured = captured.at(file, line);
        }
        if !visitor.fields.is_empty() {
            captured.context = Some(Value::Object(visitor.fields));
        }

        self.capture.submit(captured, ErrorSource::Event);
    }
}

fn level_of(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warning,
        Level::INFO => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            self.message = Some(text);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }
}
