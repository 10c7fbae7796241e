//! Deduplicating error store
//!
//! Every parsed entry lands here. Repeats of an unresolved fingerprint inside
//! the dedup window are merged into the existing record (count + last seen);
//! anything else becomes a new record. Window checks always compare against
//! `last_occurred_at`.
//!
//! Occurrence times come from the entry's own timestamp when it has one, so a
//! backlog read in one pass keeps its real spacing. Entries without one are
//! stamped with the store clock.
//!
//! Find-or-insert is serialized by an in-process write lock, and the merge
//! itself is a single `occurrence_count = occurrence_count + 1` update, so
//! concurrent repeats never lose an increment.

mod fingerprint;
pub mod types;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, days_before, from_millis, to_millis};
use crate::config::NotifierConfig;
use crate::error::{NotifierError, NotifierResult};
use crate::parser::{ErrorSource, LogLevel, ParsedEntry, RequestData};

pub use fingerprint::fingerprint;
pub use types::{
    ErrorFilter, ErrorRecord, Page, PageRequest, Statistics, StoreOutcome, UNKNOWN_FILE,
};

const RECORD_COLUMNS: &str = "id, level, message, trace, file, line, fingerprint, source, \
     environment, context, request_data, occurrence_count, first_occurred_at, last_occurred_at, \
     is_resolved, resolved_at, resolved_by, resolution_note";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dedup_enabled: bool,
    pub dedup_window: Duration,
    /// Used when an entry carries no environment tag
    pub default_environment: String,
}

impl StoreOptions {
    pub fn from_config(config: &NotifierConfig) -> Self {
        Self {
            dedup_enabled: config.dedup.enabled,
            dedup_window: config.dedup_window(),
            default_environment: config.environment.clone(),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            dedup_enabled: true,
            dedup_window: Duration::minutes(60),
            default_environment: "production".to_string(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ErrorRow {
    id: i64,
    level: String,
    message: String,
    trace: Option<String>,
    file: String,
    line: i64,
    fingerprint: String,
    source: String,
    environment: String,
    context: Option<Json<Value>>,
    request_data: Option<Json<RequestData>>,
    occurrence_count: i64,
    first_occurred_at: i64,
    last_occurred_at: i64,
    is_resolved: bool,
    resolved_at: Option<i64>,
    resolved_by: Option<i64>,
    resolution_note: Option<String>,
}

impl From<ErrorRow> for ErrorRecord {
    fn from(r: ErrorRow) -> Self {
        ErrorRecord {
            id: r.id,
            level: r.level.parse().unwrap_or(LogLevel::Error),
            message: r.message,
            trace: r.trace,
            file: r.file,
            line: u32::try_from(r.line).unwrap_or(0),
            fingerprint: r.fingerprint,
            source: r.source.parse().unwrap_or_default(),
            environment: r.environment,
            context: r.context.map(|Json(v)| v),
            request_data: r.request_data.map(|Json(v)| v),
            occurrence_count: r.occurrence_count,
            first_occurred_at: from_millis(r.first_occurred_at),
            last_occurred_at: from_millis(r.last_occurred_at),
            is_resolved: r.is_resolved,
            resolved_at: r.resolved_at.map(from_millis),
            resolved_by: r.resolved_by,
            resolution_note: r.resolution_note,
        }
    }
}

#[derive(Clone)]
pub struct ErrorStore {
    pool: SqlitePool,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl ErrorStore {
    pub fn new(pool: SqlitePool, options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            options,
            clock,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Record one occurrence, merging it into a live duplicate when possible
    pub async fn store(&self, entry: &ParsedEntry) -> NotifierResult<StoreOutcome> {
        let file = entry
            .file
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(UNKNOWN_FILE);
        let line = entry.line.unwrap_or(0);
        let fingerprint = fingerprint(&entry.message, file, line);

        let _guard = self.write_lock.lock().await;
        let occurred = entry.logged_at.unwrap_or_else(|| self.clock.now());

        if self.options.dedup_enabled {
            if let Some(record) = self.merge_repeat(&fingerprint, occurred).await? {
                debug!(id = record.id, count = record.occurrence_count, "Merged repeat occurrence");
                return Ok(StoreOutcome {
                    record,
                    is_new: false,
                });
            }
        }

        let environment = entry
            .environment
            .clone()
            .unwrap_or_else(|| self.options.default_environment.clone());
        let occurred_ms = to_millis(occurred);

        let id = sqlx::query(
            r#"
            INSERT INTO error_records
                (level, message, trace, file, line, fingerprint, source, environment,
                 context, request_data, occurrence_count, first_occurred_at, last_occurred_at, is_resolved)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, 0)
            "#,
        )
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.trace)
        .bind(file)
        .bind(i64::from(line))
        .bind(&fingerprint)
        .bind(entry.source.as_str())
        .bind(&environment)
        .bind(entry.context.as_ref().map(Json))
        .bind(entry.request.as_ref().map(Json))
        .bind(occurred_ms)
        .bind(occurred_ms)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        let record = self.require(id).await?;
        debug!(id, level = %record.level, "Stored new error record");
        Ok(StoreOutcome {
            record,
            is_new: true,
        })
    }

    async fn merge_repeat(
        &self,
        fingerprint: &str,
        occurred: DateTime<Utc>,
    ) -> NotifierResult<Option<ErrorRecord>> {
        let cutoff = occurred
            .checked_sub_signed(self.options.dedup_window)
            .map_or(i64::MIN, to_millis);
        let candidate: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM error_records
            WHERE fingerprint = ? AND is_resolved = 0 AND last_occurred_at >= ?
            ORDER BY last_occurred_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        // A resolve landing between the lookup and here makes this a no-op,
        // and the caller falls back to inserting a fresh record.
        let updated = sqlx::query(
            r#"
            UPDATE error_records
            SET occurrence_count = occurrence_count + 1,
                first_occurred_at = MIN(first_occurred_at, ?1),
                last_occurred_at = MAX(last_occurred_at, ?1)
            WHERE id = ?2 AND is_resolved = 0
            "#,
        )
        .bind(to_millis(occurred))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.find(id).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn find(&self, id: i64) -> NotifierResult<Option<ErrorRecord>> {
        let row: Option<ErrorRow> =
            sqlx::query_as(&format!("SELECT {RECORD_COLUMNS} FROM error_records WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(ErrorRecord::from))
    }

    /// Like `find`, but a missing record is an error
    pub async fn require(&self, id: i64) -> NotifierResult<ErrorRecord> {
        self.find(id).await?.ok_or(NotifierError::NotFound(id))
    }

    /// Filtered listing, most recently seen first
    pub async fn list_filtered(
        &self,
        filter: &ErrorFilter,
        page: PageRequest,
    ) -> NotifierResult<Page<ErrorRecord>> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(NotifierError::validation("date range start is after its end"));
            }
        }

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM error_records");
        push_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {RECORD_COLUMNS} FROM error_records"));
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY last_occurred_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(page.per_page))
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows: Vec<ErrorRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page::new(
            rows.into_iter().map(ErrorRecord::from).collect(),
            total,
            page,
        ))
    }

    /// Counts over records last seen within the trailing `window_days`
    pub async fn statistics(&self, window_days: i64) -> NotifierResult<Statistics> {
        if window_days <= 0 {
            return Err(NotifierError::validation("statistics window must be at least one day"));
        }
        let since = days_before(self.clock.now(), window_days)
            .map(to_millis)
            .ok_or_else(|| NotifierError::validation("statistics window is out of range"))?;

        let (total, resolved): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(is_resolved), 0) FROM error_records WHERE last_occurred_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let by_level: Vec<(String, i64)> = sqlx::query_as(
            "SELECT level, COUNT(*) FROM error_records WHERE last_occurred_at >= ? GROUP BY level",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let by_day: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT date(last_occurred_at / 1000, 'unixepoch') AS day, COUNT(*)
            FROM error_records
            WHERE last_occurred_at >= ?
            GROUP BY day
            ORDER BY day
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(Statistics {
            total,
            resolved,
            unresolved: total - resolved,
            by_level: by_level.into_iter().collect(),
            by_day: by_day.into_iter().collect(),
        })
    }

    /// Records with `id > cursor`, ascending, at most `limit`
    pub async fn records_after(&self, cursor: i64, limit: usize) -> NotifierResult<Vec<ErrorRecord>> {
        let rows: Vec<ErrorRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM error_records WHERE id > ? ORDER BY id ASC LIMIT ?"
        ))
        .bind(cursor)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ErrorRecord::from).collect())
    }

    /// Highest id currently stored, 0 when empty
    pub async fn latest_id(&self) -> NotifierResult<i64> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM error_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    // ========================================================================
    // Operator lifecycle
    // ========================================================================

    /// Resolving an already resolved record keeps its original resolution
    pub async fn resolve(
        &self,
        id: i64,
        resolved_by: Option<i64>,
        note: Option<&str>,
    ) -> NotifierResult<ErrorRecord> {
        let record = self.require(id).await?;
        if record.is_resolved {
            return Ok(record);
        }

        sqlx::query(
            r#"
            UPDATE error_records
            SET is_resolved = 1, resolved_at = ?, resolved_by = ?, resolution_note = ?
            WHERE id = ? AND is_resolved = 0
            "#,
        )
        .bind(to_millis(self.clock.now()))
        .bind(resolved_by)
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.require(id).await
    }

    /// Clear the resolution and its metadata
    pub async fn unresolve(&self, id: i64) -> NotifierResult<ErrorRecord> {
        let record = self.require(id).await?;
        if !record.is_resolved {
            return Ok(record);
        }

        sqlx::query(
            r#"
            UPDATE error_records
            SET is_resolved = 0, resolved_at = NULL, resolved_by = NULL, resolution_note = NULL
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.require(id).await
    }

    pub async fn delete(&self, id: i64) -> NotifierResult<()> {
        let result = sqlx::query("DELETE FROM error_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(NotifierError::NotFound(id));
        }
        Ok(())
    }

    /// Resolve many records; returns how many changed state
    pub async fn bulk_resolve(&self, ids: &[i64], resolved_by: Option<i64>) -> NotifierResult<u64> {
        require_ids(ids)?;
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE error_records SET is_resolved = 1, resolved_at = ");
        query
            .push_bind(to_millis(self.clock.now()))
            .push(", resolved_by = ")
            .push_bind(resolved_by)
            .push(" WHERE is_resolved = 0 AND id IN (");
        push_id_list(&mut query, ids);
        query.push(")");

        Ok(query.build().execute(&self.pool).await?.rows_affected())
    }

    pub async fn bulk_delete(&self, ids: &[i64]) -> NotifierResult<u64> {
        require_ids(ids)?;
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM error_records WHERE id IN (");
        push_id_list(&mut query, ids);
        query.push(")");

        Ok(query.build().execute(&self.pool).await?.rows_affected())
    }

    /// Retention sweep. `retention_days <= 0` keeps everything.
    pub async fn purge_older_than(&self, retention_days: i64) -> NotifierResult<u64> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = days_before(self.clock.now(), retention_days)
            .map(to_millis)
            .ok_or_else(|| NotifierError::validation("retention period is out of range"))?;
        let result = sqlx::query("DELETE FROM error_records WHERE last_occurred_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_resolved(&self) -> NotifierResult<u64> {
        let result = sqlx::query("DELETE FROM error_records WHERE is_resolved = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete everything. Ids keep increasing afterwards (AUTOINCREMENT), so
    /// stream cursors stay valid.
    pub async fn purge_all(&self) -> NotifierResult<u64> {
        let result = sqlx::query("DELETE FROM error_records")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn require_ids(ids: &[i64]) -> NotifierResult<()> {
    if ids.is_empty() {
        return Err(NotifierError::validation("no error ids given"));
    }
    Ok(())
}

fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Sqlite>, filter: &ErrorFilter) {
    query.push(" WHERE 1 = 1");

    if let Some(level) = filter.level {
        query.push(" AND level = ").push_bind(level.as_str());
    }

    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", escape_like(search));
        query
            .push(" AND (message LIKE ")
            .push_bind(pattern.clone())
            .push(r" ESCAPE '\' OR file LIKE ")
            .push_bind(pattern.clone())
            .push(r" ESCAPE '\' OR trace LIKE ")
            .push_bind(pattern)
            .push(r" ESCAPE '\')");
    }

    if let Some(resolved) = filter.resolved {
        query.push(" AND is_resolved = ").push_bind(resolved);
    }

    if let Some(from) = filter.from {
        query.push(" AND last_occurred_at >= ").push_bind(to_millis(from));
    }

    if let Some(to) = filter.to {
        query.push(" AND last_occurred_at <= ").push_bind(to_millis(to));
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', r"\\").replace('%', r"\%").replace('_', r"\_")
}
