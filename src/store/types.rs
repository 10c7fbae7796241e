// src/store/types.rs
// Error record model plus the filter/page/statistics shapes of the store API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::parser::{ErrorSource, LogLevel, RequestData};

/// File recorded when no location could be extracted
pub const UNKNOWN_FILE: &str = "Unknown";

/// The canonical error record, whatever produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Monotonic; doubles as the live stream cursor
    pub id: i64,
    pub level: LogLevel,
    pub message: String,
    pub trace: Option<String>,
    pub file: String,
    pub line: u32,
    pub fingerprint: String,
    pub source: ErrorSource,
    pub environment: String,
    pub context: Option<Value>,
    pub request_data: Option<RequestData>,
    pub occurrence_count: i64,
    pub first_occurred_at: DateTime<Utc>,
    pub last_occurred_at: DateTime<Utc>,
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<i64>,
    pub resolution_note: Option<String>,
}

impl ErrorRecord {
    /// `file:line`, or just the file when the line is unknown
    pub fn location(&self) -> String {
        if self.line > 0 {
            format!("{}:{}", self.file, self.line)
        } else {
            self.file.clone()
        }
    }

    /// First 100 characters of the message
    pub fn excerpt(&self) -> String {
        let mut excerpt = self.message.clone();
        if excerpt.chars().count() > 100 {
            crate::parser::truncate_chars(&mut excerpt, 100);
            excerpt.push_str("...");
        }
        excerpt
    }
}

/// Result of handing one entry to the store
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub record: ErrorRecord,
    /// False when the entry was merged into an existing record
    pub is_new: bool,
}

/// Listing filters; every field is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorFilter {
    pub level: Option<LogLevel>,
    /// Case-insensitive substring match over message, file and trace
    pub search: Option<String>,
    pub resolved: Option<bool>,
    /// Inclusive range over `last_occurred_at`
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub const MAX_PER_PAGE: u32 = 200;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
    pub last_page: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        let per_page = i64::from(request.per_page);
        let last_page = ((total + per_page - 1) / per_page).max(1);
        Self {
            items,
            total,
            page: request.page,
            per_page: request.per_page,
            last_page: u32::try_from(last_page).unwrap_or(u32::MAX),
        }
    }
}

/// Aggregates over records seen within a trailing window of days
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub total: i64,
    pub resolved: i64,
    pub unresolved: i64,
    pub by_level: BTreeMap<String, i64>,
    /// Keyed by `YYYY-MM-DD` (UTC) of `last_occurred_at`
    pub by_day: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_clamps() {
        let req = PageRequest::new(0, 10_000);
        assert_eq!(req.page, 1);
        assert_eq!(req.per_page, PageRequest::MAX_PER_PAGE);
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
    }

    #[test]
    fn test_last_page() {
        let page: Page<()> = Page::new(vec![], 41, PageRequest::new(1, 20));
        assert_eq!(page.last_page, 3);
        let empty: Page<()> = Page::new(vec![], 0, PageRequest::new(1, 20));
        assert_eq!(empty.last_page, 1);
    }
}
