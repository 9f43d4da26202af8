//! OpenAPI specification generation for the drillink API.
//!
//! The document is served at `/api/openapi.json` (with Swagger UI at
//! `/swagger-ui`) and written to disk by the `gen-openapi` binary.

use drillink_core::{
    CardStatus, CqbDrillResult, CqbShotResult, DrillMode, DrillRepeatSummary, DrillSetup, HitArea,
    ShotEvent, ShotMetrics, StoredResult, TargetConfig, ZoneCounts,
};
use utoipa::OpenApi;

use super::devices::DevicesResponse;
use super::drills::{ControlResponse, DrillStatusResponse};
use super::error::ErrorResponse;
use super::health::{HealthResponse, ServiceStatus};
use super::scoring::{
    AdjustedScoreRequest, AdjustedScoreResponse, CqbRequest, ScoreRequest, ScoreResponse,
};
use crate::hub::ConnectedDevice;
use crate::state::{DrillProgress, DrillRunState, RunFailure};

/// Returns the OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for drillink.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "drillink API",
        version = "0.1.0",
        description = r#"
# drillink API

drillink drives networked shooting targets through timed drills and scores
the hits they report.

## Overview

1. **Devices**: targets (or a proxy) connect over WebSocket at `/api/devices/ws`
2. **Drills**: start a drill with its target setup; each repeat configures the
   targets, waits for every `ready` acknowledgement, starts, collects shots,
   ends and is scored
3. **Scoring**: re-score recorded shots, apply operator corrections, or
   validate CQB drills

## Failures

Only two drill failures are actionable: `ack timeout` (retry the drill) and
`disconnected` (reconnect the targets). A missing `end` acknowledgement does
not fail a repeat.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local drillink server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "devices", description = "Target devices connected to the WebSocket hub"),
        (name = "drills", description = "Drill runs, their status and stored results"),
        (name = "scoring", description = "Zone scoring and CQB validation")
    ),
    paths(
        super::health::health_check,
        super::devices::list_devices,
        super::devices::connect_device,
        super::drills::start_drill,
        super::drills::current_drill,
        super::drills::stop_drill,
        super::drills::cancel_drill,
        super::drills::get_result,
        super::scoring::score_shots,
        super::scoring::score_adjusted,
        super::scoring::validate_cqb,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // System
            HealthResponse,
            ServiceStatus,
            // Devices
            ConnectedDevice,
            DevicesResponse,
            // Drills
            DrillSetup,
            DrillMode,
            TargetConfig,
            DrillStatusResponse,
            DrillProgress,
            DrillRunState,
            RunFailure,
            ControlResponse,
            StoredResult,
            DrillRepeatSummary,
            ShotEvent,
            HitArea,
            // Scoring
            ScoreRequest,
            ScoreResponse,
            AdjustedScoreRequest,
            AdjustedScoreResponse,
            ZoneCounts,
            ShotMetrics,
            CqbRequest,
            CqbDrillResult,
            CqbShotResult,
            CardStatus,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "drillink API");
        assert!(spec.paths.paths.contains_key("/api/drills"));
        assert!(spec.paths.paths.contains_key("/api/drills/results/{id}"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"drillink API\""));
    }
}
