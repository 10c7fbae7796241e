//! Structural log parser
//!
//! Splits raw log text into entries at timestamp markers
//! (`[2026-01-31 12:00:00] production.ERROR: ...`) and extracts level,
//! message, source location, stack trace and trailing JSON context.
//!
//! The parser never fails: anything it cannot make sense of is dropped.

pub mod mask;

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::config::MaskingConfig;
use crate::error::NotifierResult;
pub use mask::{MaskRule, Masker};

/// Hard cap on stored message length (characters)
pub const MAX_MESSAGE_CHARS: usize = 500;

/// How many `{`/`[` positions are tried when looking for trailing JSON
const MAX_CONTEXT_CANDIDATES: usize = 32;

static ENTRY_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\[\d{4}-\d{2}-\d{2}[T ]").expect("entry start pattern"));

static ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)^\[(?P<datetime>\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:[+-]\d{2}:?\d{2}|Z)?)\]\s+(?P<environment>\w+)\.(?P<level>\w+):\s+(?P<message>.+)$",
    )
    .expect("entry pattern")
});

static TRACE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Stack trace:|\[stacktrace\])[ \t]*\r?\n").expect("trace label pattern"));

static TRACE_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*#\d+").expect("trace frame pattern"));

static FIRST_FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"#0\s+(?P<file>[^(\n]+)\((?P<line>\d+)\)").expect("first frame pattern")
});

static INLINE_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bin\s+(?P<file>[^\s:]+):(?P<line>\d+)").expect("inline location pattern"));

// ============================================================================
// Types
// ============================================================================

/// PSR-3 / syslog severity levels, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    pub const ALL: [LogLevel; 8] = [
        LogLevel::Emergency,
        LogLevel::Alert,
        LogLevel::Critical,
        LogLevel::Error,
        LogLevel::Warning,
        LogLevel::Notice,
        LogLevel::Info,
        LogLevel::Debug,
    ];

    /// Levels monitored out of the box
    pub const DEFAULT_MONITORED: [LogLevel; 4] = [
        LogLevel::Emergency,
        LogLevel::Alert,
        LogLevel::Critical,
        LogLevel::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Emergency => "emergency",
            LogLevel::Alert => "alert",
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emergency" => Ok(LogLevel::Emergency),
            "alert" => Ok(LogLevel::Alert),
            "critical" => Ok(LogLevel::Critical),
            "error" => Ok(LogLevel::Error),
            "warning" => Ok(LogLevel::Warning),
            "notice" => Ok(LogLevel::Notice),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Where an error record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    /// Parsed out of a tailed log file
    #[default]
    Log,
    /// Captured directly from a panic or error value
    Exception,
    /// Forwarded from an in-process logging event
    Event,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Log => "log",
            ErrorSource::Exception => "exception",
            ErrorSource::Event => "event",
        }
    }
}

impl FromStr for ErrorSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(ErrorSource::Log),
            "exception" => Ok(ErrorSource::Exception),
            "event" => Ok(ErrorSource::Event),
            other => Err(format!("unknown error source: {other}")),
        }
    }
}

/// Snapshot of the request being served when an error was captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestData {
    pub method: Option<String>,
    pub path: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// One structured entry, ready for the error store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEntry {
    pub level: LogLevel,
    pub message: String,
    pub trace: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub environment: Option<String>,
    pub context: Option<Value>,
    /// Timestamp written in the log line, if any
    pub logged_at: Option<DateTime<Utc>>,
    pub source: ErrorSource,
    pub request: Option<RequestData>,
}

impl ParsedEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            trace: None,
            file: None,
            line: None,
            environment: None,
            context: None,
            logged_at: None,
            source: ErrorSource::Log,
            request: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct EntryParser {
    masker: Masker,
}

impl EntryParser {
    pub fn new(masker: Masker) -> Self {
        Self { masker }
    }

    pub fn from_config(config: &MaskingConfig) -> NotifierResult<Self> {
        Ok(Self::new(Masker::from_config(config)?))
    }

    pub fn masker(&self) -> &Masker {
        &self.masker
    }

    /// Parse a blob of log text into entries whose level is in `levels`
    pub fn parse(&self, raw: &str, levels: &[LogLevel]) -> Vec<ParsedEntry> {
        split_entries(raw)
            .filter_map(|entry| self.parse_entry(entry, levels))
            .collect()
    }

    /// Treat a single line as a complete entry
    pub fn parse_line(&self, line: &str, levels: &[LogLevel]) -> Option<ParsedEntry> {
        self.parse_entry(line, levels)
    }

    /// Apply the message cleanup, length cap and masking that parsed entries
    /// get to an entry built some other way
    pub fn sanitize(&self, mut entry: ParsedEntry) -> ParsedEntry {
        entry.message = self.masker.mask(&clean_message(&entry.message));
        truncate_chars(&mut entry.message, MAX_MESSAGE_CHARS);
        entry.trace = entry.trace.map(|t| self.masker.mask(&t));
        if let Some(value) = entry.context.as_mut() {
            self.masker.mask_value(value);
        }
        entry
    }

    fn parse_entry(&self, entry: &str, levels: &[LogLevel]) -> Option<ParsedEntry> {
        let caps = ENTRY.captures(entry.trim())?;

        let level: LogLevel = caps["level"].parse().ok()?;
        if !levels.contains(&level) {
            return None;
        }

        let (mut message, trace) = split_trace(&caps["message"]);

        let mut location = trace.as_deref().and_then(first_frame_location);
        if location.is_none() {
            location = inline_location(&message);
        }

        let mut context = None;
        if let Some((head, value)) = split_trailing_json(&message) {
            message = head;
            context = Some(value);
        }

        let mut message = self.masker.mask(&clean_message(&message));
        truncate_chars(&mut message, MAX_MESSAGE_CHARS);

        if let Some(value) = context.as_mut() {
            self.masker.mask_value(value);
        }

        let (file, line) = match location {
            Some((file, line)) => (Some(file), Some(line)),
            None => (None, None),
        };

        Some(ParsedEntry {
            level,
            message,
            trace: trace.map(|t| self.masker.mask(&t)),
            file,
            line,
            environment: Some(caps["environment"].to_string()),
            context,
            logged_at: parse_timestamp(&caps["datetime"]),
            source: ErrorSource::Log,
            request: None,
        })
    }
}

/// Split raw text at every line that starts with a `[YYYY-MM-DD` marker.
/// Text before the first marker is a fragment of an earlier entry and is dropped.
fn split_entries(raw: &str) -> impl Iterator<Item = &str> {
    let starts: Vec<usize> = ENTRY_START.find_iter(raw).map(|m| m.start()).collect();
    let ends: Vec<usize> = starts.iter().skip(1).copied().chain([raw.len()]).collect();
    starts
        .into_iter()
        .zip(ends)
        .map(move |(start, end)| &raw[start..end])
        .filter(|entry| !entry.trim().is_empty())
}

/// Pull a labelled `#0 ... #N` frame block out of the message body.
/// Returns the remaining message and the trace text.
fn split_trace(body: &str) -> (String, Option<String>) {
    let Some(label) = TRACE_LABEL.find(body) else {
        return (body.to_string(), None);
    };

    let after = &body[label.end()..];
    let mut frames = Vec::new();
    let mut consumed = 0;
    for line in after.split_inclusive('\n') {
        if !TRACE_FRAME.is_match(line) {
            break;
        }
        frames.push(line.trim());
        consumed += line.len();
    }

    if frames.is_empty() {
        return (body.to_string(), None);
    }

    let head = body[..label.start()].trim_end();
    let tail = after[consumed..].trim();
    let message = if tail.is_empty() {
        head.to_string()
    } else {
        format!("{head} {tail}")
    };
    (message, Some(frames.join("\n")))
}

fn first_frame_location(trace: &str) -> Option<(String, u32)> {
    let caps = FIRST_FRAME.captures(trace)?;
    let line = caps["line"].parse().ok()?;
    Some((caps["file"].trim().to_string(), line))
}

fn inline_location(message: &str) -> Option<(String, u32)> {
    let caps = INLINE_LOCATION.captures(message)?;
    let line = caps["line"].parse().ok()?;
    Some((caps["file"].to_string(), line))
}

/// Find the leftmost `{` or `[` from which the rest of the message decodes as
/// a JSON object or array. The message is never reduced to nothing.
fn split_trailing_json(message: &str) -> Option<(String, Value)> {
    let trimmed = message.trim_end();
    let closes_json = trimmed.ends_with('}') || trimmed.ends_with(']');
    if !closes_json {
        return None;
    }

    trimmed
        .char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .take(MAX_CONTEXT_CANDIDATES)
        .find_map(|(pos, _)| {
            let head = trimmed[..pos].trim_end();
            if head.is_empty() {
                return None;
            }
            match serde_json::from_str::<Value>(&trimmed[pos..]) {
                Ok(value @ (Value::Object(_) | Value::Array(_))) => Some((head.to_string(), value)),
                _ => None,
            }
        })
}

fn clean_message(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate on a character boundary
pub(crate) fn truncate_chars(text: &mut String, max_chars: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(idx);
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = raw.replacen(' ', "T", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
