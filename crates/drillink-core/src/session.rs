//! Drill sessions: N sequential repeats of one drill setup.
//!
//! A session runs each repeat to a terminal state before configuring the
//! next one, shares a single [`MessageChannel`] across all of them, and stops
//! at the first failed repeat. Completed repeats are optionally persisted and
//! their result id back-filled before observers see them.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use crate::channel::MessageChannel;
use crate::config::{LinkSettings, SessionSettings};
use crate::error::DrillError;
use crate::link::{run_repeat, LinkFailure, RepeatSignal, SignalReceiver};
use crate::storage::ResultStore;
use crate::types::{DrillRepeatSummary, DrillSetup};

/// Callbacks for the caller presenting a session.
///
/// All methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    /// A repeat completed and, if a store is attached, was persisted.
    fn on_repeat_complete(&self, _summary: &DrillRepeatSummary) {}

    /// Every repeat completed.
    fn on_drill_complete(&self, _summaries: &[DrillRepeatSummary]) {}

    /// A repeat failed and the session was aborted.
    fn on_drill_failed(&self, _failure: &SessionFailure) {}
}

/// Why a session was aborted.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFailure {
    /// The repeat that failed (1-based).
    pub repeat_index: u32,
    /// What went wrong.
    pub failure: LinkFailure,
    /// Summaries of the repeats that completed before the failure.
    pub completed: Vec<DrillRepeatSummary>,
}

impl SessionFailure {
    /// Reason string: "ack timeout", "disconnected", "cancelled", ...
    #[must_use]
    pub fn reason(&self) -> String {
        self.failure.reason()
    }

    /// Whether the caller cancelled the session.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self.failure, LinkFailure::Cancelled)
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repeat {} failed: {}", self.repeat_index, self.failure)
    }
}

impl std::error::Error for SessionFailure {}

impl From<SessionFailure> for DrillError {
    fn from(failure: SessionFailure) -> Self {
        failure.failure.into()
    }
}

/// Caller-side control of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<RepeatSignal>,
}

impl SessionHandle {
    /// Ends the running phase of the current repeat. A stop sent while the
    /// repeat is being set up takes effect once it is running; one sent
    /// between repeats is dropped.
    ///
    /// Returns `false` if the session has already finished.
    pub fn stop(&self) -> bool {
        self.tx.send(RepeatSignal::Stop).is_ok()
    }

    /// Aborts the session; the current repeat fails with "cancelled".
    ///
    /// Returns `false` if the session has already finished.
    pub fn cancel(&self) -> bool {
        self.tx.send(RepeatSignal::Cancel).is_ok()
    }
}

/// Saves a completed repeat off the async workers and back-fills its id.
async fn persist(
    store: Option<Arc<dyn ResultStore>>,
    drill_name: String,
    summary: &mut DrillRepeatSummary,
) {
    let Some(store) = store else {
        return;
    };
    let record = summary.clone();
    let saved = tokio::task::spawn_blocking(move || store.save(&drill_name, &record)).await;
    match saved {
        Ok(Ok(id)) => summary.attach_result_id(id),
        Ok(Err(err)) => warn!(
            repeat = summary.repeat_index,
            error = %err,
            "Failed to persist repeat result"
        ),
        Err(err) => warn!(
            repeat = summary.repeat_index,
            error = %err,
            "Persistence task failed"
        ),
    }
}

/// Runs the repeats of one drill over a shared channel.
pub struct DrillSession {
    channel: Arc<dyn MessageChannel>,
    setup: DrillSetup,
    link_settings: LinkSettings,
    session_settings: SessionSettings,
    store: Option<Arc<dyn ResultStore>>,
    observers: Vec<Arc<dyn SessionObserver>>,
    signals_tx: mpsc::UnboundedSender<RepeatSignal>,
    signals: SignalReceiver,
}

impl fmt::Debug for DrillSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrillSession")
            .field("setup", &self.setup)
            .field("link_settings", &self.link_settings)
            .field("session_settings", &self.session_settings)
            .field("has_store", &self.store.is_some())
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl DrillSession {
    /// Creates a session for a validated setup with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`DrillError::InvalidSetup`] if the setup does not validate.
    pub fn new(channel: Arc<dyn MessageChannel>, setup: DrillSetup) -> Result<Self, DrillError> {
        setup
            .validate()
            .map_err(|err| DrillError::InvalidSetup(err.to_string()))?;
        let (signals_tx, signals) = mpsc::unbounded_channel();
        Ok(Self {
            channel,
            setup,
            link_settings: LinkSettings::default(),
            session_settings: SessionSettings::default(),
            store: None,
            observers: Vec::new(),
            signals_tx,
            signals,
        })
    }

    /// Uses the given protocol timings.
    #[must_use]
    pub fn with_link_settings(mut self, settings: LinkSettings) -> Self {
        self.link_settings = settings;
        self
    }

    /// Uses the given session pacing.
    #[must_use]
    pub fn with_session_settings(mut self, settings: SessionSettings) -> Self {
        self.session_settings = settings;
        self
    }

    /// Persists each completed repeat to `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers an observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// The setup this session runs.
    #[must_use]
    pub const fn setup(&self) -> &DrillSetup {
        &self.setup
    }

    /// A handle for stopping or cancelling the session.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.signals_tx.clone(),
        }
    }

    /// Drops stops aimed at a repeat that already finished. A queued cancel
    /// still aborts.
    fn discard_stale_stops(&mut self) -> Result<(), LinkFailure> {
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                RepeatSignal::Cancel => return Err(LinkFailure::Cancelled),
                RepeatSignal::Stop => debug!("Dropping stop sent after the repeat ended"),
            }
        }
        Ok(())
    }

    /// Pause between repeats. Only a cancel interrupts it; stops are dropped.
    async fn pause(&mut self) -> Result<(), LinkFailure> {
        self.discard_stale_stops()?;
        let interval = self.session_settings.repeat_interval();
        if interval.is_zero() {
            return Ok(());
        }
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                signal = self.signals.recv() => match signal {
                    Some(RepeatSignal::Cancel) => return Err(LinkFailure::Cancelled),
                    Some(RepeatSignal::Stop) => debug!("Dropping stop sent between repeats"),
                    None => {}
                },
            }
        }
        Ok(())
    }

    fn abort(
        &self,
        repeat_index: u32,
        failure: LinkFailure,
        completed: Vec<DrillRepeatSummary>,
    ) -> SessionFailure {
        let failure = SessionFailure {
            repeat_index,
            failure,
            completed,
        };
        warn!(repeat = repeat_index, reason = %failure.reason(), "Drill aborted");
        for observer in &self.observers {
            observer.on_drill_failed(&failure);
        }
        failure
    }

    async fn run_repeats(&mut self) -> Result<Vec<DrillRepeatSummary>, SessionFailure> {
        let mut summaries = Vec::new();
        for repeat_index in 1..=self.setup.repeats {
            if repeat_index > 1 {
                if let Err(failure) = self.pause().await {
                    return Err(self.abort(repeat_index, failure, summaries));
                }
            }

            let result = run_repeat(
                self.channel.as_ref(),
                &self.setup,
                &self.link_settings,
                repeat_index,
                Some(&mut self.signals),
            )
            .await;

            match result {
                Ok(mut summary) => {
                    let drill_name = self.setup.name.clone();
                    persist(self.store.clone(), drill_name, &mut summary).await;
                    for observer in &self.observers {
                        observer.on_repeat_complete(&summary);
                    }
                    summaries.push(summary);
                }
                Err(failure) => return Err(self.abort(repeat_index, failure, summaries)),
            }
        }

        info!(repeats = summaries.len(), "Drill complete");
        for observer in &self.observers {
            observer.on_drill_complete(&summaries);
        }
        Ok(summaries)
    }

    /// Runs every repeat in order.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionFailure`] for the first repeat that fails; later
    /// repeats are not attempted.
    pub async fn run(mut self) -> Result<Vec<DrillRepeatSummary>, SessionFailure> {
        let span = tracing::info_span!(
            "drill",
            drill = %self.setup.name,
            repeats = self.setup.repeats
        );
        self.run_repeats().instrument(span).await
    }
}
