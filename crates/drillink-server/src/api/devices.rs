//! Device API endpoints.
//!
//! Target devices connect to `/api/devices/ws?name=<target>` and exchange
//! JSON text frames in the wire vocabulary. A proxy bridging BLE targets can
//! connect under any name and include `device` in the payloads it forwards.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use drillink_core::is_valid_target_name;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::hub::ConnectedDevice;
use crate::state::SharedState;

/// Creates the devices router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_devices))
        .route("/ws", get(connect_device))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Connected devices.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevicesResponse {
    /// Devices sorted by name.
    pub devices: Vec<ConnectedDevice>,
}

/// Query parameters for the device socket.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct ConnectQuery {
    /// Target name the socket speaks for.
    #[param(example = "t1")]
    pub name: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// List connected devices.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    operation_id = "listDevices",
    summary = "List connected target devices",
    description = "Returns the target devices currently connected to the \
        WebSocket hub.",
    responses(
        (status = 200, description = "Devices listed", body = DevicesResponse)
    )
)]
pub async fn list_devices(State(state): State<SharedState>) -> Json<DevicesResponse> {
    Json(DevicesResponse {
        devices: state.hub.devices(),
    })
}

/// Open a device socket.
#[utoipa::path(
    get,
    path = "/api/devices/ws",
    tag = "devices",
    operation_id = "connectDevice",
    summary = "Connect a target device",
    description = "Upgrades to a WebSocket registered under `name`. Outbound \
        commands addressed to `name`, and every broadcast, are written as text \
        frames; inbound text frames are fed to the running drill.",
    params(ConnectQuery),
    responses(
        (status = 101, description = "Switching to the WebSocket protocol"),
        (status = 400, description = "Invalid target name", body = ErrorResponse),
        (status = 409, description = "Name already connected", body = ErrorResponse)
    )
)]
pub async fn connect_device(
    State(state): State<SharedState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    if !is_valid_target_name(&query.name) {
        return Err(ApiError::bad_request(
            "invalid_target_name",
            format!("'{}' is not a valid target name", query.name),
        ));
    }
    if state.hub.devices().iter().any(|d| d.name == query.name) {
        return Err(ApiError::conflict(
            "device_already_connected",
            format!("device '{}' is already connected", query.name),
        ));
    }
    Ok(ws.on_upgrade(move |socket| serve_device(state, query.name, socket)))
}

async fn serve_device(state: SharedState, name: String, socket: WebSocket) {
    let registration = match state.hub.register(&name) {
        Ok(registration) => registration,
        Err(err) => {
            warn!(device = %name, error = %err, "Rejecting device socket");
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();
    let mut outbound = registration.outbound;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => state.hub.inbound(&name, text.as_str()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => state.hub.inbound(&name, text),
                Err(_) => debug!(device = %name, "Ignoring non-UTF-8 binary frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(device = %name, error = %err, "Device socket error");
                break;
            }
        }
    }

    state.hub.unregister(&name, registration.id);
    writer.abort();
}
