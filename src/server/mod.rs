//! HTTP surface: the axum router over the stream manager, motion history,
//! and SSE broadcaster, plus the listener lifecycle.

pub mod handlers;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::manager::StreamManager;
use crate::motion::{MotionEngine, WorkerPool};
use crate::pool::FrameBufferPool;
use crate::recording::{MotionHistory, RecordingController};
use crate::sse::SseBroadcaster;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub sse: Arc<SseBroadcaster>,
    pub history: Arc<MotionHistory>,
    pub pool: Arc<FrameBufferPool>,
    pub workers: Arc<WorkerPool>,
    pub engine: Option<Arc<MotionEngine>>,
    pub recorder: Option<Arc<RecordingController>>,
    pub pause_password: String,
    pub pause_duration: Duration,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stream/:source_id", get(handlers::mjpeg_stream))
        .route("/api/stream/:source_id/pause", post(handlers::pause_stream))
        .route("/api/stream/:source_id/status", get(handlers::stream_status))
        .route("/api/sources", get(handlers::list_sources))
        .route("/api/events/motion", get(handlers::motion_events))
        .route("/api/motion/history", get(handlers::motion_history))
        .route("/api/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the listener and serve until cancelled.
///
/// A bind failure is fatal and names the attempted address and platform so
/// the operator can tell a port clash from a privilege problem.
pub async fn serve(
    state: AppState,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let address = format!("{}:{}", config.host, config.port);

    let listener =
        tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|e| ServerError::BindFailed {
                address: address.clone(),
                platform: std::env::consts::OS,
                source: e,
            })?;

    info!("HTTP server listening on {}", address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ServerError::Serve {
            details: e.to_string(),
        })
}
