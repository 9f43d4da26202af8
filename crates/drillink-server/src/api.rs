//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `devices` - Device listing and the WebSocket device socket
//! - `drills` - Drill runs and stored results
//! - `health` - Service health checks
//! - `scoring` - Zone scoring and CQB validation
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod devices;
pub mod drills;
pub mod error;
pub mod health;
pub mod openapi;
pub mod scoring;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::{get_openapi_json, ApiDoc};

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                     - Health check
/// /api
/// ├── /devices                - Connected devices, WebSocket at /devices/ws
/// ├── /drills                 - Start, current, stop, cancel, results
/// ├── /scoring                - Score, adjusted score, CQB validation
/// └── /openapi.json           - OpenAPI specification
/// /swagger-ui                 - Swagger UI
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .nest("/devices", devices::router())
                .nest("/drills", drills::router())
                .nest("/scoring", scoring::router()),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use drillink_core::wire::{ack_payload, AckKind, Command, OutboundMessage};
    use drillink_core::{DrillinkConfig, JsonResultStore, ShotEvent};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::hub::DeviceHub;
    use crate::state::AppState;

    fn test_state(temp_dir: &TempDir) -> SharedState {
        let hub = Arc::new(DeviceHub::new());
        let store = Arc::new(JsonResultStore::new(temp_dir.path()));
        AppState::with_parts(DrillinkConfig::default(), Arc::clone(&hub), hub, store).shared()
    }

    async fn call(
        state: &SharedState,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn setup_json(repeats: u32) -> Value {
        json!({
            "name": "doubles",
            "mode": "ipsc",
            "repeats": repeats,
            "targets": [
                {
                    "sequenceNumber": 1, "targetName": "t1", "targetType": "ipsc",
                    "timeoutSeconds": 10.0, "countedShots": 2
                },
                {
                    "sequenceNumber": 2, "targetName": "t2", "targetType": "popper",
                    "timeoutSeconds": 10.0, "countedShots": 1
                }
            ]
        })
    }

    /// Polls the current run until it leaves `running`.
    async fn wait_for_finish(state: &SharedState) -> Value {
        for _ in 0..250 {
            let (_, body) = call(state, "GET", "/api/drills/current", None).await;
            if body["state"] != "running" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("drill still running");
    }

    /// Answers every command for one registered device.
    fn spawn_device(hub: Arc<DeviceHub>, name: &'static str, shots: Vec<(&'static str, f64)>) {
        let mut registration = hub.register(name).unwrap();
        tokio::spawn(async move {
            while let Some(frame) = registration.outbound.recv().await {
                let Ok(message) = serde_json::from_str::<OutboundMessage>(&frame) else {
                    continue;
                };
                match message.command() {
                    Some(Command::Ready { .. }) => {
                        hub.inbound(name, &ack_payload(name, AckKind::Ready).to_string());
                    }
                    Some(Command::Start { .. }) => {
                        for (area, diff) in &shots {
                            let shot = ShotEvent::new(name, *area, *diff, "ipsc").to_wire();
                            hub.inbound(name, &shot.to_string());
                        }
                    }
                    Some(Command::End) => {
                        hub.inbound(name, &ack_payload(name, AckKind::End).to_string());
                    }
                    _ => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn test_health() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let (status, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["linkConnected"], false);

        let _t1 = state.hub.register("t1").unwrap();
        let (_, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connectedDevices"], 1);
        assert_eq!(body["transport"], "websocket");
    }

    #[tokio::test]
    async fn test_score_endpoint() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let request = json!({
            "targets": [
                {
                    "sequenceNumber": 1, "targetName": "t1", "targetType": "ipsc",
                    "timeoutSeconds": 30
                }
            ],
            "shots": [
                {"device": "t1", "actualHitArea": "azone", "actualTimeDiff": 0.5},
                {"device": "t1", "actualHitArea": "czone", "actualTimeDiff": 0.25}
            ],
            "totalTime": 0.75
        });
        let (status, body) = call(&state, "POST", "/api/scoring/score", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["score"], 8);
        assert_eq!(body["zoneCounts"]["A"], 1);
        assert_eq!(body["zoneCounts"]["C"], 1);
        assert_eq!(body["metrics"]["effectiveTotalTime"], 0.75);
    }

    #[tokio::test]
    async fn test_cqb_endpoint() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let request = json!({
            "targetNames": ["cqb_front", "cqb_hostage"],
            "shots": [
                {"device": "cqb_front", "actualHitArea": "head", "actualTimeDiff": 0.5},
                {"device": "cqb_front", "actualHitArea": "body", "actualTimeDiff": 0.3}
            ],
            "drillDuration": 0.8
        });
        let (status, body) = call(&state, "POST", "/api/scoring/cqb", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["drillPassed"], true);
    }

    #[tokio::test]
    async fn test_start_without_devices_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let (status, body) = call(&state, "POST", "/api/drills", Some(setup_json(1))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "disconnected");
    }

    #[tokio::test]
    async fn test_invalid_setup_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let _t1 = state.hub.register("t1").unwrap();
        let (status, body) = call(&state, "POST", "/api/drills", Some(setup_json(0))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_setup");
    }

    #[tokio::test]
    async fn test_no_current_drill() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let (status, _) = call(&state, "GET", "/api/drills/current", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, "POST", "/api/drills/current/stop", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = call(&state, "GET", "/api/drills/results/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "result_not_found");
    }

    #[tokio::test]
    async fn test_drill_runs_to_completion() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        spawn_device(Arc::clone(&state.hub), "t1", vec![("azone", 0.6), ("azone", 0.3)]);
        spawn_device(Arc::clone(&state.hub), "t2", vec![("popperzone", 0.4)]);

        let (status, body) = call(&state, "POST", "/api/drills", Some(setup_json(2))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["state"], "running");
        assert_eq!(body["drillName"], "doubles");

        let current = wait_for_finish(&state).await;
        assert_eq!(current["state"], "completed");
        let summaries = current["summaries"].as_array().unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0]["score"], 15);

        let id = summaries[0]["drillResultId"].as_str().unwrap();
        let uri = format!("/api/drills/results/{id}");
        let (status, stored) = call(&state, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["id"], id);
    }

    #[tokio::test]
    async fn test_second_start_conflicts_then_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        // Registered but silent: the run stays waiting for ready acks.
        let _t1 = state.hub.register("t1").unwrap();
        let _t2 = state.hub.register("t2").unwrap();

        let (status, _) = call(&state, "POST", "/api/drills", Some(setup_json(1))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = call(&state, "POST", "/api/drills", Some(setup_json(1))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "session_busy");

        let (status, body) = call(&state, "POST", "/api/drills/current/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);

        let current = wait_for_finish(&state).await;
        assert_eq!(current["state"], "cancelled");
        assert_eq!(current["failure"]["reason"], "cancelled");
        assert_eq!(current["failure"]["actionable"], false);
        assert!(current["summaries"].as_array().unwrap().is_empty());

        let (status, body) = call(&state, "POST", "/api/drills/current/stop", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "drill_not_running");
    }

    #[tokio::test]
    async fn test_stop_ends_running_repeat_with_its_shots() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let hub = Arc::clone(&state.hub);
        let mut registration = hub.register("t1").unwrap();
        let (fired_tx, fired_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let mut fired_tx = Some(fired_tx);
            while let Some(frame) = registration.outbound.recv().await {
                let Ok(message) = serde_json::from_str::<OutboundMessage>(&frame) else {
                    continue;
                };
                match message.command() {
                    Some(Command::Ready { .. }) => {
                        hub.inbound("t1", &ack_payload("t1", AckKind::Ready).to_string());
                    }
                    Some(Command::Start { .. }) => {
                        for area in ["azone", "czone"] {
                            let shot = ShotEvent::new("t1", area, 0.4, "ipsc").to_wire();
                            hub.inbound("t1", &shot.to_string());
                        }
                        if let Some(tx) = fired_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Some(Command::End) => {
                        hub.inbound("t1", &ack_payload("t1", AckKind::End).to_string());
                    }
                    _ => {}
                }
            }
        });

        // No counted shots: the repeat only ends on stop or max duration.
        let setup = json!({
            "name": "open ended",
            "mode": "ipsc",
            "repeats": 1,
            "targets": [
                {
                    "sequenceNumber": 1, "targetName": "t1", "targetType": "ipsc",
                    "timeoutSeconds": 60
                }
            ]
        });
        let (status, _) = call(&state, "POST", "/api/drills", Some(setup)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        fired_rx.await.unwrap();
        let (status, body) = call(&state, "POST", "/api/drills/current/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);

        let current = wait_for_finish(&state).await;
        assert_eq!(current["state"], "completed");
        let summaries = current["summaries"].as_array().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0]["shots"].as_array().unwrap().len(), 2);
        assert_eq!(summaries[0]["shots"][1]["hitArea"], "czone");
    }

    #[tokio::test]
    async fn test_unconnected_target_fails_with_ack_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = DrillinkConfig::default();
        config.link.ready_ack_timeout_secs = 0.2;
        let hub = Arc::new(DeviceHub::new());
        let store = Arc::new(JsonResultStore::new(temp_dir.path()));
        let state = AppState::with_parts(config, Arc::clone(&hub), hub, store).shared();
        spawn_device(Arc::clone(&state.hub), "t1", vec![("azone", 0.6)]);

        let (status, _) = call(&state, "POST", "/api/drills", Some(setup_json(1))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let current = wait_for_finish(&state).await;
        assert_eq!(current["state"], "failed");
        assert_eq!(current["failure"]["reason"], "ack timeout");
        assert_eq!(current["failure"]["actionable"], true);
        assert_eq!(current["failure"]["errorCode"], "ACK_TIMEOUT");
    }

    #[tokio::test]
    async fn test_openapi_is_served() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir);
        let (status, body) = call(&state, "GET", "/api/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["info"]["title"], "drillink API");
    }
}
