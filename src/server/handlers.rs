use crate::frame::Frame;
use crate::mjpeg::MjpegProxy;
use crate::sse::KEEPALIVE_INTERVAL;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use uuid::Uuid;

use super::AppState;

/// One multipart part header; parts carry no Content-Length so the header is
/// a shared constant
const PART_HEADER: &[u8] = b"--mjpegBoundary\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

/// GET /api/stream/{sourceId}: live MJPEG fan-out
pub async fn mjpeg_stream(
    Path(source_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let proxy = match state.manager.get_proxy(&source_id) {
        Ok(proxy) => proxy,
        Err(_) => return unknown_source(&state, &source_id),
    };

    let mut conn = proxy.add_viewer();
    let viewer_id = conn.id;
    info!(source = %source_id, viewer = %viewer_id, "MJPEG stream started");

    let stream = async_stream::stream! {
        let _guard = ViewerGuard {
            proxy: Arc::clone(&proxy),
            id: viewer_id,
        };
        while let Some(frame) = conn.rx.recv().await {
            // Three separate writes per part so the transport can use
            // vectored I/O; the frame body is handed over zero-copy
            yield Ok::<_, Infallible>(Bytes::from_static(PART_HEADER));
            yield Ok(frame_body(frame));
            yield Ok(Bytes::from_static(PART_TRAILER));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=mjpegBoundary",
        )
        .header(header::CACHE_CONTROL, "no-cache, private")
        .header(header::PRAGMA, "no-cache")
        .body(axum::body::Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn frame_body(frame: Frame) -> Bytes {
    Bytes::from_owner(frame)
}

/// Removes the viewer when the response stream drops, however it ends
struct ViewerGuard {
    proxy: Arc<MjpegProxy>,
    id: Uuid,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.proxy.remove_viewer(self.id);
    }
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    #[serde(default)]
    password: String,
}

/// POST /api/stream/{sourceId}/pause: password-gated pause
pub async fn pause_stream(
    Path(source_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<PauseRequest>,
) -> Response {
    let proxy = match state.manager.get_proxy(&source_id) {
        Ok(proxy) => proxy,
        Err(_) => return unknown_source(&state, &source_id),
    };

    if state.pause_password.is_empty() || request.password != state.pause_password {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "success": false,
                "error": "unauthorized",
                "message": "invalid pause password",
            })),
        )
            .into_response();
    }

    let until = proxy.pause(state.pause_duration);
    let until_epoch_ms = until
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    Json(json!({
        "success": true,
        "untilEpochMs": until_epoch_ms,
    }))
    .into_response()
}

/// GET /api/stream/{sourceId}/status: pause state for pollers
pub async fn stream_status(
    Path(source_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let proxy = match state.manager.get_proxy(&source_id) {
        Ok(proxy) => proxy,
        Err(_) => return unknown_source(&state, &source_id),
    };

    let status = proxy.pause_status();
    let remaining_ms = status
        .remaining
        .map(|r| r.as_millis() as u64)
        .unwrap_or(0);
    let until_epoch_ms = status.remaining.map(|r| {
        (SystemTime::now() + r)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    });

    Json(json!({
        "isPaused": status.paused,
        "untilEpochMs": until_epoch_ms,
        "remainingMs": remaining_ms,
    }))
    .into_response()
}

/// GET /api/sources: configured sources
pub async fn list_sources(State(state): State<AppState>) -> Response {
    Json(state.manager.list_sources()).into_response()
}

/// GET /api/events/motion: long-lived SSE channel for motion notifications
pub async fn motion_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscriber_id, mut events) = state.sse.subscribe();
    let broadcaster = Arc::clone(&state.sse);

    let stream = async_stream::stream! {
        let _guard = SseGuard {
            broadcaster,
            id: subscriber_id,
        };
        while let Some(payload) = events.recv().await {
            yield Ok(Event::default().data(payload));
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

struct SseGuard {
    broadcaster: Arc<crate::sse::SseBroadcaster>,
    id: Uuid,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    since: Option<u64>,
}

/// GET /api/motion/history: recent motion events
pub async fn motion_history(
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Response {
    let limit = query.limit.unwrap_or(50).min(500);
    let offset = query.offset.unwrap_or(0);
    let page = state.history.query(limit, offset, query.since);

    let events: Vec<serde_json::Value> = page.events.iter().map(|e| e.to_json()).collect();
    Json(json!({
        "success": true,
        "events": events,
        "total": page.total,
        "offset": page.offset,
        "limit": page.limit,
        "stats": state.history.stats(),
    }))
    .into_response()
}

/// GET /api/health: process-level health and counters
pub async fn health(State(state): State<AppState>) -> Response {
    let sources: Vec<serde_json::Value> = state
        .manager
        .list_sources()
        .iter()
        .map(|summary| {
            let stats = state
                .manager
                .existing_proxy(&summary.id)
                .map(|proxy| serde_json::to_value(proxy.stats()).unwrap_or_default());
            json!({
                "id": summary.id,
                "isDefault": summary.is_default,
                "proxy": stats,
            })
        })
        .collect();

    Json(json!({
        "status": "healthy",
        "sources": sources,
        "bufferPool": state.pool.stats(),
        "workerPool": state.workers.stats(),
        "detector": state.engine.as_ref().map(|e| e.stats()),
        "recording": state.recorder.as_ref().map(|r| r.stats()),
        "sse": state.sse.stats(),
    }))
    .into_response()
}

fn unknown_source(state: &AppState, source_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "message": format!("Unknown source: {}", source_id),
            "availableSources": state.manager.source_ids(),
        })),
    )
        .into_response()
}
