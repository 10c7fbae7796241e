// src/stream/recent.rs
// Bounded in-memory log of the newest records, keyed by id

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::RecordSource;
use crate::error::NotifierResult;
use crate::store::ErrorRecord;

/// Newest-N records in ascending id order. Oldest entries are trimmed once
/// capacity is exceeded.
#[derive(Debug)]
pub struct RecentErrors {
    capacity: usize,
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl RecentErrors {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Insert or replace by id, keeping ascending order
    pub fn push(&self, record: ErrorRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.binary_search_by_key(&record.id, |r| r.id) {
            Ok(idx) => records[idx] = record,
            Err(idx) => records.insert(idx, record),
        }
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    /// Up to `limit` records, newest first
    pub fn latest(&self, limit: usize) -> Vec<ErrorRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl RecordSource for RecentErrors {
    async fn records_after(&self, cursor: i64, limit: usize) -> NotifierResult<Vec<ErrorRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .filter(|r| r.id > cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_id(&self) -> NotifierResult<i64> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.back().map(|r| r.id).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ErrorSource, LogLevel};
    use chrono::Utc;

    fn record(id: i64, count: i64) -> ErrorRecord {
        let now = Utc::now();
        ErrorRecord {
            id,
            level: LogLevel::Error,
            message: "m".into(),
            trace: None,
            file: "Unknown".into(),
            line: 0,
            fingerprint: String::new(),
            source: ErrorSource::Exception,
            environment: "production".into(),
            context: None,
            request_data: None,
            occurrence_count: count,
            first_occurred_at: now,
            last_occurred_at: now,
            is_resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        }
    }

    #[tokio::test]
    async fn test_keeps_newest_in_order() {
        let recent = RecentErrors::new(3);
        for id in [2, 1, 5, 4, 3] {
            recent.push(record(id, 1));
        }
        let ids: Vec<i64> = recent.records_after(0, 10).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(recent.latest_id().await.unwrap(), 5);
        assert_eq!(recent.latest(2).iter().map(|r| r.id).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[tokio::test]
    async fn test_push_replaces_same_id() {
        let recent = RecentErrors::new(3);
        recent.push(record(1, 1));
        recent.push(record(1, 4));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent.latest(1)[0].occurrence_count, 4);
        recent.clear();
        assert!(recent.is_empty());
        assert_eq!(recent.latest_id().await.unwrap(), 0);
    }
}
