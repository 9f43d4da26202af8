//! Drill API endpoints.
//!
//! One drill run at a time: starting a drill spawns a session over the
//! configured transport and returns immediately; progress is polled from
//! `/api/drills/current`. Completed repeats are persisted and can be fetched
//! by their result id.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use drillink_core::{DrillError, DrillSession, DrillSetup, StoredResult};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::{ActiveDrill, DrillProgress, ProgressRecorder, SharedState};

/// Creates the drills router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", post(start_drill))
        .route("/current", get(current_drill))
        .route("/current/stop", post(stop_drill))
        .route("/current/cancel", post(cancel_drill))
        .route("/results/{id}", get(get_result))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Status of the current or last drill run.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrillStatusResponse {
    /// Run identifier.
    pub id: Uuid,
    /// Drill name.
    #[schema(example = "el presidente")]
    pub drill_name: String,
    /// Repeats requested.
    #[schema(example = 3)]
    pub repeats: u32,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Progress so far.
    #[serde(flatten)]
    pub progress: DrillProgress,
}

impl DrillStatusResponse {
    fn from_active(drill: &ActiveDrill) -> Self {
        Self {
            id: drill.id,
            drill_name: drill.drill_name.clone(),
            repeats: drill.repeats,
            started_at: drill.started_at,
            progress: drill.progress.snapshot(),
        }
    }
}

/// Outcome of a stop or cancel request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    /// Whether the running session received the request.
    pub accepted: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a drill.
#[utoipa::path(
    post,
    path = "/api/drills",
    tag = "drills",
    operation_id = "startDrill",
    summary = "Start a drill run",
    description = "Validates the setup and runs its repeats in the background. \
        Each repeat configures the targets, waits for every ready \
        acknowledgement, starts, collects shots, ends and is scored. The run \
        aborts at the first failed repeat.",
    request_body = DrillSetup,
    responses(
        (status = 202, description = "Drill started", body = DrillStatusResponse),
        (status = 400, description = "Invalid setup", body = ErrorResponse),
        (status = 409, description = "A drill is already running", body = ErrorResponse),
        (status = 503, description = "No target link", body = ErrorResponse)
    )
)]
pub async fn start_drill(
    State(state): State<SharedState>,
    Json(setup): Json<DrillSetup>,
) -> ApiResult<(StatusCode, Json<DrillStatusResponse>)> {
    let mut current = state.drill.write().await;
    if current.as_ref().is_some_and(ActiveDrill::is_running) {
        return Err(DrillError::SessionBusy.into());
    }
    if !state.channel.is_connected() {
        return Err(ApiError::unavailable(
            "disconnected",
            "no target devices are connected",
        ));
    }

    let progress = Arc::new(ProgressRecorder::default());
    let session = DrillSession::new(Arc::clone(&state.channel), setup)?
        .with_link_settings(state.config.link.clone())
        .with_session_settings(state.config.session.clone())
        .with_store(Arc::clone(&state.store))
        .with_observer(progress.clone());

    let drill = ActiveDrill {
        id: Uuid::new_v4(),
        drill_name: session.setup().name.clone(),
        repeats: session.setup().repeats,
        started_at: Utc::now(),
        handle: session.handle(),
        progress,
    };
    info!(run = %drill.id, drill = %drill.drill_name, repeats = drill.repeats, "Starting drill");

    tokio::spawn(async move {
        // Outcome is reported through the progress recorder.
        let _ = session.run().await;
    });

    let response = DrillStatusResponse::from_active(&drill);
    *current = Some(drill);
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Get the current drill run.
#[utoipa::path(
    get,
    path = "/api/drills/current",
    tag = "drills",
    operation_id = "getCurrentDrill",
    summary = "Get the current or last drill run",
    description = "Returns the state of the most recent run, with the \
        summaries of its completed repeats and, on failure, the reason. \
        Only 'ack timeout' and 'disconnected' failures are actionable.",
    responses(
        (status = 200, description = "Run status", body = DrillStatusResponse),
        (status = 404, description = "No drill has been started", body = ErrorResponse)
    )
)]
pub async fn current_drill(
    State(state): State<SharedState>,
) -> ApiResult<Json<DrillStatusResponse>> {
    let current = state.drill.read().await;
    current
        .as_ref()
        .map(|drill| Json(DrillStatusResponse::from_active(drill)))
        .ok_or_else(no_drill)
}

/// Stop the running repeat.
#[utoipa::path(
    post,
    path = "/api/drills/current/stop",
    tag = "drills",
    operation_id = "stopDrill",
    summary = "End the running repeat",
    description = "Sends the end command for the running repeat, which is \
        then scored. A stop sent before the repeat starts running applies as \
        soon as it does.",
    responses(
        (status = 200, description = "Request delivered", body = ControlResponse),
        (status = 404, description = "No drill has been started", body = ErrorResponse),
        (status = 409, description = "The drill is no longer running", body = ErrorResponse)
    )
)]
pub async fn stop_drill(State(state): State<SharedState>) -> ApiResult<Json<ControlResponse>> {
    let drill = running_drill(&state).await?;
    Ok(Json(ControlResponse {
        accepted: drill.handle.stop(),
    }))
}

/// Cancel the drill run.
#[utoipa::path(
    post,
    path = "/api/drills/current/cancel",
    tag = "drills",
    operation_id = "cancelDrill",
    summary = "Cancel the drill run",
    description = "Aborts the run; the current repeat produces no summary.",
    responses(
        (status = 200, description = "Request delivered", body = ControlResponse),
        (status = 404, description = "No drill has been started", body = ErrorResponse),
        (status = 409, description = "The drill is no longer running", body = ErrorResponse)
    )
)]
pub async fn cancel_drill(State(state): State<SharedState>) -> ApiResult<Json<ControlResponse>> {
    let drill = running_drill(&state).await?;
    Ok(Json(ControlResponse {
        accepted: drill.handle.cancel(),
    }))
}

/// Get a stored repeat result.
#[utoipa::path(
    get,
    path = "/api/drills/results/{id}",
    tag = "drills",
    operation_id = "getDrillResult",
    summary = "Get a stored repeat result",
    params(("id" = String, Path, description = "Result id from a repeat summary")),
    responses(
        (status = 200, description = "Stored result", body = StoredResult),
        (status = 404, description = "Unknown result id", body = ErrorResponse)
    )
)]
pub async fn get_result(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StoredResult>> {
    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.load(&id))
        .await
        .map_err(|err| ApiError::InternalError {
            error_code: "persistence_error".to_string(),
            message: err.to_string(),
        })??;
    Ok(Json(result))
}

// ============================================================================
// Helpers
// ============================================================================

fn no_drill() -> ApiError {
    ApiError::not_found("no_drill", "no drill has been started")
}

async fn running_drill(state: &SharedState) -> ApiResult<ActiveDrill> {
    let current = state.drill.read().await;
    let drill = current.as_ref().ok_or_else(no_drill)?;
    if !drill.is_running() {
        return Err(ApiError::conflict("drill_not_running", "the drill is no longer running"));
    }
    Ok(drill.clone())
}
