//! Scoring API endpoints.
//!
//! Stateless wrappers over the scoring engine and CQB validator, used to
//! re-score recorded shots and to apply operator corrections after a drill.

use std::collections::BTreeMap;

use axum::routing::post;
use axum::{Json, Router};
use drillink_core::cqb::validate_drill;
use drillink_core::{
    calculate_effective_counts, calculate_score_from_adjusted_hit_zones, CqbDrillResult, ShotEvent,
    ShotMetrics, TargetConfig, ZoneCounts,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Creates the scoring router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/score", post(score_shots))
        .route("/adjusted", post(score_adjusted))
        .route("/cqb", post(validate_cqb))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Shots to score against a target configuration.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "targets": [
        {"sequenceNumber": 1, "targetName": "t1", "targetType": "ipsc", "timeoutSeconds": 30.0}
    ],
    "shots": [
        {"device": "t1", "actualHitArea": "azone", "actualTimeDiff": 0.82},
        {"device": "t1", "actualHitArea": "czone", "actualTimeDiff": 0.31}
    ],
    "totalTime": 1.13
}))]
#[serde(rename_all = "camelCase")]
pub struct ScoreRequest {
    /// Configured targets.
    pub targets: Vec<TargetConfig>,
    /// Shots in arrival order.
    pub shots: Vec<ShotEvent>,
    /// Drill-reported total time in seconds; 0 to derive it from the shots.
    #[serde(default)]
    pub total_time: f64,
}

/// Score and metrics for a shot list.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResponse {
    /// Clamped total score.
    #[schema(example = 8)]
    pub score: i32,
    /// Effective zone counts.
    pub zone_counts: ZoneCounts,
    /// Derived metrics.
    pub metrics: ShotMetrics,
}

/// Operator-corrected zone counts.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "zones": {"A": 3, "C": 1, "M": 1},
    "targets": [
        {"sequenceNumber": 1, "targetName": "t1", "targetType": "ipsc", "timeoutSeconds": 30.0}
    ]
}))]
#[serde(rename_all = "camelCase")]
pub struct AdjustedScoreRequest {
    /// Counts keyed by zone letter (A, C, D, N, M, PE).
    pub zones: BTreeMap<String, u32>,
    /// Configured targets.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Score of an adjusted zone map.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdjustedScoreResponse {
    /// Clamped total score.
    #[schema(example = 3)]
    pub score: i32,
}

/// Shots to validate as a CQB drill.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CqbRequest {
    /// Names of the drill's targets.
    #[schema(example = json!(["cqb_front", "cqb_hostage"]))]
    pub target_names: Vec<String>,
    /// Shots in arrival order.
    pub shots: Vec<ShotEvent>,
    /// Drill duration in seconds.
    #[serde(default)]
    pub drill_duration: f64,
}

// ============================================================================
// Handlers
// ============================================================================

/// Score a shot list.
#[utoipa::path(
    post,
    path = "/api/scoring/score",
    tag = "scoring",
    operation_id = "scoreShots",
    summary = "Score a shot list",
    description = "Applies zone scoring to the shots: only the best required hits \
        per paper target count, missing hits are penalised as misses, and \
        configured targets without a valid hit add a missed-target penalty. \
        The score is never negative.",
    request_body = ScoreRequest,
    responses(
        (status = 200, description = "Shots scored", body = ScoreResponse),
        (status = 422, description = "Malformed request body")
    )
)]
pub async fn score_shots(Json(request): Json<ScoreRequest>) -> Json<ScoreResponse> {
    let zone_counts = calculate_effective_counts(&request.shots, &request.targets);
    let metrics = ShotMetrics::compute(&request.shots, &request.targets, request.total_time);
    Json(ScoreResponse {
        score: zone_counts.score(),
        zone_counts,
        metrics,
    })
}

/// Score operator-adjusted zone counts.
#[utoipa::path(
    post,
    path = "/api/scoring/adjusted",
    tag = "scoring",
    operation_id = "scoreAdjusted",
    summary = "Score adjusted zone counts",
    description = "Applies the scoring formula to manually corrected zone \
        counts. Zone keys are case-insensitive; the result is never negative.",
    request_body = AdjustedScoreRequest,
    responses(
        (status = 200, description = "Counts scored", body = AdjustedScoreResponse)
    )
)]
pub async fn score_adjusted(
    Json(request): Json<AdjustedScoreRequest>,
) -> Json<AdjustedScoreResponse> {
    Json(AdjustedScoreResponse {
        score: calculate_score_from_adjusted_hit_zones(&request.zones, &request.targets),
    })
}

/// Validate a CQB drill.
#[utoipa::path(
    post,
    path = "/api/scoring/cqb",
    tag = "scoring",
    operation_id = "validateCqb",
    summary = "Validate a CQB drill",
    description = "Threat targets need two head/body hits, non-threat targets \
        must not be hit. Targets outside both sets are ignored.",
    request_body = CqbRequest,
    responses(
        (status = 200, description = "Drill validated", body = CqbDrillResult)
    )
)]
pub async fn validate_cqb(Json(request): Json<CqbRequest>) -> Json<CqbDrillResult> {
    let names: Vec<&str> = request.target_names.iter().map(String::as_str).collect();
    Json(validate_drill(&request.shots, &names, request.drill_duration))
}
