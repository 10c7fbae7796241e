// src/server/handlers.rs

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{
        IntoResponse,
        sse::{Event, Sse},
    },
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::parser::LogLevel;
use crate::store::{ErrorFilter, ErrorRecord, Page, PageRequest, Statistics};
use crate::stream::StreamFrame;

const DEFAULT_STATISTICS_DAYS: i64 = 7;
const DEFAULT_RECENT_LIMIT: usize = 20;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "enabled": state.watcher.is_enabled(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub level: Option<String>,
    pub search: Option<String>,
    pub resolved: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

pub async fn list_errors(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Page<ErrorRecord>>> {
    let level = params
        .level
        .as_deref()
        .filter(|l| !l.is_empty())
        .map(str::parse::<LogLevel>)
        .transpose()
        .map_err(ApiError::bad_request)?;

    let filter = ErrorFilter {
        level,
        search: params.search,
        resolved: params.resolved,
        from: params.from,
        to: params.to,
    };
    let page = PageRequest::new(params.page.unwrap_or(1), params.per_page.unwrap_or(20));

    Ok(Json(state.watcher.store().list_filtered(&filter, page).await?))
}

pub async fn get_error(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ErrorRecord>> {
    Ok(Json(state.watcher.store().require(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    pub resolved_by: Option<i64>,
    pub note: Option<String>,
}

/// Body is optional; an empty body resolves anonymously
pub async fn resolve_error(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<Json<ErrorRecord>> {
    let request: ResolveRequest = if body.is_empty() {
        ResolveRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?
    };

    let record = state
        .watcher
        .store()
        .resolve(id, request.resolved_by, request.note.as_deref())
        .await?;
    Ok(Json(record))
}

pub async fn unresolve_error(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ErrorRecord>> {
    Ok(Json(state.watcher.store().unresolve(id).await?))
}

pub async fn delete_error(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.watcher.store().delete(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Resolve,
    Delete,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub action: BulkAction,
    pub ids: Vec<i64>,
    pub resolved_by: Option<i64>,
}

pub async fn bulk_action(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> ApiResult<Json<Value>> {
    let store = state.watcher.store();
    let affected = match request.action {
        BulkAction::Resolve => store.bulk_resolve(&request.ids, request.resolved_by).await?,
        BulkAction::Delete => store.bulk_delete(&request.ids).await?,
    };
    Ok(Json(json!({ "affected": affected })))
}

#[derive(Debug, Deserialize)]
pub struct StatisticsParams {
    pub days: Option<i64>,
}

pub async fn statistics(
    State(state): State<AppState>,
    Query(params): Query<StatisticsParams>,
) -> ApiResult<Json<Statistics>> {
    let days = params.days.unwrap_or(DEFAULT_STATISTICS_DAYS);
    Ok(Json(state.watcher.store().statistics(days).await?))
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

/// Newest records seen by this process, newest first
pub async fn recent(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Json<Vec<ErrorRecord>> {
    let limit = params.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    Json(state.watcher.recent().latest(limit))
}

/// Run one ingestion pass now
pub async fn trigger_watch(State(state): State<AppState>) -> Json<Value> {
    let created = state.watcher.watch().await;
    Json(json!({
        "new_errors": created.len(),
        "records": created,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub last_event_id: Option<i64>,
}

/// Bounded SSE session. The cursor comes from `Last-Event-ID` (set by
/// browsers on reconnect) or the `last_event_id` query parameter.
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    let cursor = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .or(params.last_event_id)
        .unwrap_or(0)
        .max(0);

    let events = state
        .broker
        .open(cursor)
        .map(|frame| Ok::<_, Infallible>(to_event(frame)));

    (
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        Sse::new(events),
    )
}

fn to_event(frame: StreamFrame) -> Event {
    match frame {
        StreamFrame::Comment(text) => Event::default().comment(text),
        StreamFrame::Record { id, payload } => Event::default()
            .id(id.to_string())
            .json_data(&payload)
            .unwrap_or_else(|_| Event::default().comment("unserializable record")),
        StreamFrame::Heartbeat => Event::default().comment("heartbeat"),
        StreamFrame::Close { reason } => Event::default().event("close").data(reason),
    }
}
