// src/lib.rs

pub mod capture;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod notify;
pub mod parser;
pub mod server;
pub mod store;
pub mod stream;
pub mod tailer;
pub mod watcher;

pub use capture::{CaptureLayer, CapturedException, ExceptionCapture};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::NotifierConfig;
pub use error::{NotifierError, NotifierResult};
pub use parser::{EntryParser, LogLevel, ParsedEntry};
pub use store::{ErrorRecord, ErrorStore, StoreOutcome};
pub use stream::{LiveStreamBroker, RecentErrors, RecordSource, StreamFrame};
pub use tailer::FileTailer;
pub use watcher::LogWatcher;
