//! Service and target-link health.
//!
//! The service is `degraded` while no target link is up: scoring still works
//! but drills cannot start.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::{DrillRunState, SharedState};

/// Overall service status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Targets are reachable.
    Ok,
    /// No target link; drills cannot start.
    Degraded,
}

/// Health of the service and its target link.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "transport": "websocket",
    "linkConnected": true,
    "connectedDevices": 3,
    "drillState": "running"
}))]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok` while the target link is up.
    pub status: ServiceStatus,

    /// Crate version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// `websocket` for the device hub, `ble` for a BLE proxy.
    #[schema(example = "websocket")]
    pub transport: String,

    /// Whether the drill transport is up.
    pub link_connected: bool,

    /// Sockets registered with the hub.
    #[schema(example = 3, minimum = 0)]
    pub connected_devices: usize,

    /// State of the current or last drill run, if any.
    pub drill_state: Option<DrillRunState>,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Report service health.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service and target-link health",
    description = "Reports whether the target link is up, how many devices \
        are connected to the hub and the state of the latest drill run. \
        Status is `degraded` while the link is down.",
    responses(
        (status = 200, description = "Health reported", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let drill_state = state
        .drill
        .read()
        .await
        .as_ref()
        .map(|drill| drill.progress.snapshot().state);
    let link_connected = state.channel.is_connected();

    Json(HealthResponse {
        status: if link_connected {
            ServiceStatus::Ok
        } else {
            ServiceStatus::Degraded
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        transport: if state.config.ble.is_configured() && cfg!(feature = "bluetooth") {
            "ble".to_string()
        } else {
            "websocket".to_string()
        },
        link_connected,
        connected_devices: state.hub.device_count(),
        drill_state,
    })
}
