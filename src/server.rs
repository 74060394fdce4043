//! HTTP and WebSocket transport over a [`ScanHandle`].

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::engine::{ScanHandle, TriggerOutcome};
use crate::error::StoreError;
use crate::models::{DeviceSummary, Snapshot};

const DEFAULT_SCAN_LIMIT: u32 = 20;
const MAX_SCAN_LIMIT: u32 = 500;

#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: ScanHandle,
    /// Bound on a single WebSocket frame write.
    pub send_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/devices", get(get_devices))
        .route("/api/devices/{id}/notes", post(update_notes))
        .route("/api/database/stats", get(database_stats))
        .route("/api/scans", get(recent_scans))
        .route("/api/scan", post(scan_now))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => {
                tracing::debug!(device = %id, "Note target not found");
                Self::new(StatusCode::NOT_FOUND, format!("Device not found: {id}"))
            }
            StoreError::InvalidNote(message) => Self::new(StatusCode::BAD_REQUEST, message),
            other => {
                tracing::error!(error = %other, "Store request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
            }
        }
    }
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "name": "lanwatch",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "devices": "GET /api/devices",
            "notes": "POST /api/devices/{id}/notes",
            "stats": "GET /api/database/stats",
            "scans": "GET /api/scans?limit=N",
            "scan": "POST /api/scan",
            "websocket": "GET /ws",
        }
    }))
}

#[derive(Debug, Serialize)]
struct DevicesResponse {
    success: bool,
    count: usize,
    online: usize,
    #[serde(flatten)]
    snapshot: Arc<Snapshot>,
}

async fn get_devices(State(state): State<AppState>) -> Json<DevicesResponse> {
    let snapshot = state.engine.get_snapshot();
    Json(DevicesResponse {
        success: true,
        count: snapshot.devices.len(),
        online: snapshot.online_count(),
        snapshot,
    })
}

#[derive(Debug, Deserialize)]
struct NotesBody {
    notes: String,
}

async fn update_notes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NotesBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state.engine.set_note(&id, &body.notes).await?;
    tracing::info!(mac = %record.hardware_id, "Device note updated");
    Ok(Json(json!({
        "success": true,
        "device": DeviceSummary::from(&record),
    })))
}

async fn database_stats(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.engine.get_history_stats().await?;
    Ok(Json(json!({
        "success": true,
        "stats": stats,
    })))
}

#[derive(Debug, Deserialize)]
struct ScansQuery {
    limit: Option<u32>,
}

async fn recent_scans(
    State(state): State<AppState>,
    Query(query): Query<ScansQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_SCAN_LIMIT).clamp(1, MAX_SCAN_LIMIT);
    let scans = state.engine.recent_scans(limit).await?;
    Ok(Json(json!({
        "success": true,
        "count": scans.len(),
        "scans": scans,
    })))
}

async fn scan_now(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let outcome = state.engine.trigger_scan_now();
    let status = match outcome {
        TriggerOutcome::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        TriggerOutcome::Started | TriggerOutcome::AlreadyRunning => StatusCode::ACCEPTED,
    };
    (
        status,
        Json(json!({
            "started": outcome.started(),
            "outcome": outcome,
        })),
    )
}

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ScanNow,
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let observer = match state.engine.register_observer().await {
        Ok(observer) => observer,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting WebSocket, hub unavailable");
            return;
        }
    };
    let observer_id = observer.id;
    let mut events = observer.events;
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let send_timeout = state.send_timeout;

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(event.as_ref()) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, event = event.kind(), "Failed to encode event");
                    continue;
                }
            };
            match tokio::time::timeout(send_timeout, ws_sender.send(Message::Text(text.into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(observer_id = %observer_id, error = %e, "WebSocket write failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(observer_id = %observer_id, "WebSocket write timed out");
                    break;
                }
            }
        }
    });

    let engine = state.engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if let Ok(ClientMessage::ScanNow) = serde_json::from_str(text.as_str()) {
                        let outcome = engine.trigger_scan_now();
                        tracing::debug!(observer_id = %observer_id, ?outcome, "Scan requested over WebSocket");
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(observer_id = %observer_id, error = %e, "WebSocket read failed");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.engine.deregister_observer(observer_id);
}
