//! Application state shared across handlers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use drillink_core::{
    DrillError, DrillRepeatSummary, DrillinkConfig, JsonResultStore, MessageChannel, ResultStore,
    SessionFailure, SessionHandle, SessionObserver,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::hub::DeviceHub;

/// State handle passed to every handler.
pub type SharedState = Arc<AppState>;

/// Lifecycle of a drill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DrillRunState {
    /// Repeats are in progress.
    Running,
    /// Every repeat completed.
    Completed,
    /// A repeat failed and the run was aborted.
    Failed,
    /// The run was cancelled by the operator.
    Cancelled,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    /// Repeat that failed (1-based).
    pub repeat_index: u32,
    /// "ack timeout", "disconnected", "cancelled", ...
    #[schema(example = "ack timeout")]
    pub reason: String,
    /// Whether the operator should retry or reconnect.
    pub actionable: bool,
    /// Error code of the failure.
    #[schema(example = "ACK_TIMEOUT")]
    pub error_code: String,
}

/// Progress of a run, updated by the session as it goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrillProgress {
    /// Current lifecycle state.
    pub state: DrillRunState,
    /// Summaries of completed repeats, in order.
    pub summaries: Vec<DrillRepeatSummary>,
    /// Set when the run failed or was cancelled.
    pub failure: Option<RunFailure>,
}

impl Default for DrillProgress {
    fn default() -> Self {
        Self {
            state: DrillRunState::Running,
            summaries: Vec::new(),
            failure: None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session observer recording into a [`DrillProgress`].
#[derive(Debug, Default)]
pub struct ProgressRecorder {
    progress: Mutex<DrillProgress>,
}

impl ProgressRecorder {
    /// Snapshot of the current progress.
    pub fn snapshot(&self) -> DrillProgress {
        lock(&self.progress).clone()
    }
}

impl SessionObserver for ProgressRecorder {
    fn on_repeat_complete(&self, summary: &DrillRepeatSummary) {
        lock(&self.progress).summaries.push(summary.clone());
    }

    fn on_drill_complete(&self, _summaries: &[DrillRepeatSummary]) {
        lock(&self.progress).state = DrillRunState::Completed;
    }

    fn on_drill_failed(&self, failure: &SessionFailure) {
        let mut progress = lock(&self.progress);
        progress.state = if failure.is_cancellation() {
            DrillRunState::Cancelled
        } else {
            DrillRunState::Failed
        };
        progress.failure = Some(RunFailure {
            repeat_index: failure.repeat_index,
            reason: failure.reason(),
            actionable: failure.failure.is_actionable(),
            error_code: DrillError::from(failure.clone()).error_code().to_string(),
        });
    }
}

/// The drill run most recently started.
#[derive(Debug, Clone)]
pub struct ActiveDrill {
    /// Run identifier.
    pub id: Uuid,
    /// Drill name from the setup.
    pub drill_name: String,
    /// Number of repeats requested.
    pub repeats: u32,
    /// When the run was started.
    pub started_at: DateTime<Utc>,
    /// Stop/cancel control.
    pub handle: SessionHandle,
    /// Progress reported by the session.
    pub progress: Arc<ProgressRecorder>,
}

impl ActiveDrill {
    /// Whether the run is still in progress.
    pub fn is_running(&self) -> bool {
        self.progress.snapshot().state == DrillRunState::Running
    }
}

/// Shared application state.
pub struct AppState {
    /// Loaded configuration.
    pub config: DrillinkConfig,
    /// WebSocket devices.
    pub hub: Arc<DeviceHub>,
    /// Transport used for drills: the hub, or BLE when configured.
    pub channel: Arc<dyn MessageChannel>,
    /// Where completed repeats are persisted.
    pub store: Arc<dyn ResultStore>,
    /// Current or last drill run.
    pub drill: RwLock<Option<ActiveDrill>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// State using the WebSocket hub as transport and the configured store.
    pub fn new(config: DrillinkConfig) -> Self {
        let hub = Arc::new(DeviceHub::new());
        let store = Arc::new(JsonResultStore::new(config.storage.resolved_data_dir()));
        Self::with_parts(config, Arc::clone(&hub), hub, store)
    }

    /// State from explicit parts.
    pub fn with_parts(
        config: DrillinkConfig,
        hub: Arc<DeviceHub>,
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            config,
            hub,
            channel,
            store,
            drill: RwLock::new(None),
        }
    }

    /// Wraps the state for sharing.
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }
}
