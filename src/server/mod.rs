// src/server/mod.rs
// HTTP surface: REST operations over the error store plus the live SSE stream

pub mod error;
pub mod handlers;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{StreamConfig, StreamSourceKind};
use crate::error::NotifierResult;
use crate::stream::{LiveStreamBroker, RecordSource, StreamSettings};
use crate::watcher::LogWatcher;

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub watcher: Arc<LogWatcher>,
    pub broker: LiveStreamBroker,
}

impl AppState {
    /// The stream reads either the durable store or the in-memory recent
    /// buffer, per `stream.source`
    pub fn new(watcher: Arc<LogWatcher>, stream: &StreamConfig) -> Self {
        let source: Arc<dyn RecordSource> = match stream.source {
            StreamSourceKind::Store => Arc::new(watcher.store().clone()),
            StreamSourceKind::Memory => watcher.recent().clone(),
        };
        let broker = LiveStreamBroker::new(source, StreamSettings::from(stream));
        Self { watcher, broker }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/errors", get(handlers::list_errors))
        .route("/api/errors/bulk", post(handlers::bulk_action))
        .route(
            "/api/errors/{id}",
            get(handlers::get_error).delete(handlers::delete_error),
        )
        .route("/api/errors/{id}/resolve", post(handlers::resolve_error))
        .route("/api/errors/{id}/unresolve", post(handlers::unresolve_error))
        .route("/api/statistics", get(handlers::statistics))
        .route("/api/recent", get(handlers::recent))
        .route("/api/watch", post(handlers::trigger_watch))
        .route("/api/stream", get(handlers::stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves. Open stream sessions are bounded, so
/// draining them takes at most one session length.
pub async fn serve<F>(bind_address: &str, state: AppState, shutdown: F) -> NotifierResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!(address = %bind_address, "HTTP server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
