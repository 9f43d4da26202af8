//! Drill link protocol.
//!
//! One repeat of a drill is driven through a fixed sequence of phases:
//!
//! ```text
//! Idle -> Configuring -> AwaitingReadyAcks -> Armed -> Running -> AwaitingEndAck -> Completed
//!   \__________________________________________________________________________/
//!                                    -> Failed
//! ```
//!
//! [`DrillLink`] is the synchronous state machine: it turns caller actions
//! and inbound payloads into outbound messages and state changes, one event
//! at a time. [`run_repeat`] is the async driver that feeds it from a
//! [`MessageChannel`], enforces the timeouts and reacts to caller signals.
//!
//! Timeouts behave differently on purpose: missing `ready` acks fail the
//! repeat with "ack timeout", while missing `end` acks only log a warning and
//! the repeat completes with the shots collected so far.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::channel::{ChannelError, ChannelEvent, ChannelEvents, MessageChannel};
use crate::config::LinkSettings;
use crate::scoring::summarize_repeat;
use crate::types::{DrillMode, DrillRepeatSummary, DrillSetup, ShotEvent, TargetConfig};
use crate::wire::{AckKind, AnimationContent, Command, InboundMessage, OutboundMessage};

/// Why a repeat ended in `Failed`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkFailure {
    /// Not every target acknowledged `ready` before the timeout.
    #[error("ack timeout")]
    AckTimeout {
        /// Targets that never acknowledged.
        missing: Vec<String>,
    },

    /// The transport reported a disconnect.
    #[error("disconnected")]
    Disconnected,

    /// The caller cancelled the repeat.
    #[error("cancelled")]
    Cancelled,

    /// The transport rejected a message.
    #[error("channel error: {0}")]
    Channel(String),
}

impl LinkFailure {
    /// Reason string reported to the caller.
    #[must_use]
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Ack timeouts and disconnects warrant a retry/reconnect prompt.
    #[must_use]
    pub const fn is_actionable(&self) -> bool {
        matches!(self, Self::AckTimeout { .. } | Self::Disconnected)
    }
}

impl From<ChannelError> for LinkFailure {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Disconnected => Self::Disconnected,
            other => Self::Channel(other.to_string()),
        }
    }
}

/// Caller request delivered to a running repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatSignal {
    /// End the running phase now.
    Stop,
    /// Abort the repeat without a summary.
    Cancel,
}

/// Receiving half of the caller signal queue.
pub type SignalReceiver = mpsc::UnboundedReceiver<RepeatSignal>;

/// Data-free view of the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Nothing sent yet.
    Idle,
    /// Sending animation configuration.
    Configuring,
    /// Waiting for every target's `ready` ack.
    AwaitingReadyAcks,
    /// All targets ready; `start` not yet sent.
    Armed,
    /// Collecting shots.
    Running,
    /// `end` sent; waiting for acks.
    AwaitingEndAck,
    /// Scored.
    Completed,
    /// Aborted.
    Failed,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Protocol state, carrying only what each phase needs.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum LinkState {
    Idle,
    Configuring,
    AwaitingReadyAcks {
        pending: BTreeSet<String>,
    },
    Armed,
    Running {
        started_at: Instant,
        last_shot_at: Option<Instant>,
        shots: Vec<ShotEvent>,
    },
    AwaitingEndAck {
        pending: BTreeSet<String>,
        shots: Vec<ShotEvent>,
        total_time: f64,
    },
    Completed,
    Failed(LinkFailure),
}

impl LinkState {
    /// The phase this state belongs to.
    #[must_use]
    pub const fn phase(&self) -> LinkPhase {
        match self {
            Self::Idle => LinkPhase::Idle,
            Self::Configuring => LinkPhase::Configuring,
            Self::AwaitingReadyAcks { .. } => LinkPhase::AwaitingReadyAcks,
            Self::Armed => LinkPhase::Armed,
            Self::Running { .. } => LinkPhase::Running,
            Self::AwaitingEndAck { .. } => LinkPhase::AwaitingEndAck,
            Self::Completed => LinkPhase::Completed,
            Self::Failed(_) => LinkPhase::Failed,
        }
    }

    /// `Completed` and `Failed` are terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Effect of one inbound payload.
#[derive(Debug, PartialEq)]
pub enum LinkStep {
    /// Not relevant in the current phase, duplicate, or malformed.
    Ignored,
    /// A target acknowledged `ready`; others are still pending.
    ReadyAck { remaining: usize },
    /// The last `ready` ack arrived.
    Armed,
    /// A shot was recorded. `all_counted` is set once every target
    /// delivered its counted shots.
    ShotRecorded { all_counted: bool },
    /// A target acknowledged `end`; others are still pending.
    EndAck { remaining: usize },
    /// The last `end` ack arrived and the repeat is scored.
    Completed(Box<DrillRepeatSummary>),
}

/// State machine for a single drill repeat.
#[derive(Debug)]
pub struct DrillLink {
    repeat_index: u32,
    mode: DrillMode,
    targets: Vec<TargetConfig>,
    settings: LinkSettings,
    state: LinkState,
}

impl DrillLink {
    /// Creates a link in `Idle` for the given repeat (1-based).
    #[must_use]
    pub fn new(setup: &DrillSetup, settings: LinkSettings, repeat_index: u32) -> Self {
        Self {
            repeat_index,
            mode: setup.mode,
            targets: setup.ordered_targets(),
            settings,
            state: LinkState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &LinkState {
        &self.state
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> LinkPhase {
        self.state.phase()
    }

    /// Repeat number this link drives.
    #[must_use]
    pub const fn repeat_index(&self) -> u32 {
        self.repeat_index
    }

    /// Settings in effect for this repeat.
    #[must_use]
    pub const fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Whether `device` is one of the drill's targets.
    #[must_use]
    pub fn has_target(&self, device: &str) -> bool {
        self.targets.iter().any(|t| t.target_name == device)
    }

    fn target_names(&self) -> BTreeSet<String> {
        self.targets.iter().map(|t| t.target_name.clone()).collect()
    }

    /// `Idle -> Configuring`: returns one `animation_config` per target in
    /// sequence order.
    pub fn configure(&mut self) -> Vec<OutboundMessage> {
        if !matches!(self.state, LinkState::Idle) {
            return Vec::new();
        }
        self.state = LinkState::Configuring;
        self.targets
            .iter()
            .map(|target| OutboundMessage::AnimationConfig {
                dest: target.target_name.clone(),
                content: AnimationContent {
                    target_id: target.target_name.clone(),
                    action: target
                        .animation_action
                        .clone()
                        .unwrap_or_else(|| target.target_type().to_string()),
                    duration: target.animation_duration.unwrap_or(target.timeout_seconds),
                },
            })
            .collect()
    }

    /// `Configuring -> AwaitingReadyAcks`: returns one `ready` per target.
    ///
    /// A drill without targets has nothing to wait for and is armed at once.
    pub fn request_ready(&mut self) -> Vec<OutboundMessage> {
        if !matches!(self.state, LinkState::Configuring) {
            return Vec::new();
        }
        let last = self.targets.len().saturating_sub(1);
        let messages = self
            .targets
            .iter()
            .enumerate()
            .map(|(index, target)| OutboundMessage::Forward {
                dest: Some(target.target_name.clone()),
                content: Command::Ready {
                    is_first: index == 0,
                    is_last: index == last,
                    target_type: target.target_type().to_string(),
                    timeout: target.timeout_seconds,
                    delay: self.settings.inter_target_delay_secs,
                },
            })
            .collect();

        let pending = self.target_names();
        self.state = if pending.is_empty() {
            LinkState::Armed
        } else {
            LinkState::AwaitingReadyAcks { pending }
        };
        messages
    }

    /// `Armed -> Running`: returns the `start` command and starts the clock.
    pub fn arm(&mut self, now: Instant) -> Option<OutboundMessage> {
        if !matches!(self.state, LinkState::Armed) {
            return None;
        }
        self.state = LinkState::Running {
            started_at: now,
            last_shot_at: None,
            shots: Vec::new(),
        };
        Some(OutboundMessage::Forward {
            dest: None,
            content: Command::Start {
                repeat: self.repeat_index,
            },
        })
    }

    /// `Running -> AwaitingEndAck`: returns the `end` command.
    pub fn finish(&mut self) -> Option<OutboundMessage> {
        if !matches!(self.state, LinkState::Running { .. }) {
            return None;
        }
        let pending = self.target_names();
        let LinkState::Running {
            started_at,
            last_shot_at,
            shots,
        } = std::mem::replace(&mut self.state, LinkState::Completed)
        else {
            return None;
        };
        let total_time = last_shot_at.map_or(0.0, |at| at.duration_since(started_at).as_secs_f64());
        self.state = LinkState::AwaitingEndAck {
            pending,
            shots,
            total_time,
        };
        Some(OutboundMessage::Forward {
            dest: None,
            content: Command::End,
        })
    }

    /// Targets that have not acknowledged the current command.
    #[must_use]
    pub fn pending_acks(&self) -> Vec<String> {
        match &self.state {
            LinkState::AwaitingReadyAcks { pending }
            | LinkState::AwaitingEndAck { pending, .. } => pending.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Failure describing the current missing `ready` acks.
    #[must_use]
    pub fn ack_timeout_failure(&self) -> LinkFailure {
        LinkFailure::AckTimeout {
            missing: self.pending_acks(),
        }
    }

    /// `AwaitingEndAck -> Completed` regardless of outstanding acks.
    pub fn complete(&mut self) -> Option<DrillRepeatSummary> {
        if !matches!(self.state, LinkState::AwaitingEndAck { .. }) {
            return None;
        }
        let LinkState::AwaitingEndAck {
            shots, total_time, ..
        } = std::mem::replace(&mut self.state, LinkState::Completed)
        else {
            return None;
        };
        Some(summarize_repeat(
            self.repeat_index,
            self.mode,
            &self.targets,
            shots,
            total_time,
        ))
    }

    /// Moves to `Failed` unless already terminal.
    pub fn fail(&mut self, failure: LinkFailure) {
        if !self.state.is_terminal() {
            self.state = LinkState::Failed(failure);
        }
    }

    /// Applies one inbound payload.
    pub fn handle(&mut self, payload: &Value, now: Instant) -> LinkStep {
        let message = match InboundMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, phase = %self.phase(), "Dropping malformed payload");
                return LinkStep::Ignored;
            }
        };

        match (&mut self.state, message) {
            (
                LinkState::AwaitingReadyAcks { pending },
                InboundMessage::Ack {
                    device,
                    kind: AckKind::Ready,
                    status,
                },
            ) => {
                if !pending.remove(&device) {
                    debug!(device = %device, "Ignoring duplicate or unknown ready ack");
                    return LinkStep::Ignored;
                }
                debug!(device = %device, status = ?status, remaining = pending.len(), "Ready ack");
                if pending.is_empty() {
                    self.state = LinkState::Armed;
                    LinkStep::Armed
                } else {
                    LinkStep::ReadyAck {
                        remaining: pending.len(),
                    }
                }
            }
            (
                LinkState::Running {
                    shots,
                    last_shot_at,
                    ..
                },
                InboundMessage::Shot(shot),
            ) => {
                debug!(
                    device = %shot.device,
                    area = %shot.actual_hit_area,
                    split = shot.actual_time_diff,
                    "Shot received"
                );
                shots.push(shot);
                *last_shot_at = Some(now);
                LinkStep::ShotRecorded {
                    all_counted: self.settings.auto_end_on_counted_shots
                        && counted_shots_delivered(&self.targets, shots),
                }
            }
            (
                LinkState::AwaitingEndAck { pending, .. },
                InboundMessage::Ack {
                    device,
                    kind: AckKind::End,
                    ..
                },
            ) => {
                if !pending.remove(&device) {
                    debug!(device = %device, "Ignoring duplicate or unknown end ack");
                    return LinkStep::Ignored;
                }
                if pending.is_empty() {
                    self.complete()
                        .map_or(LinkStep::Ignored, |summary| LinkStep::Completed(Box::new(summary)))
                } else {
                    LinkStep::EndAck {
                        remaining: pending.len(),
                    }
                }
            }
            (state, message) => {
                debug!(
                    phase = %state.phase(),
                    message = ?message,
                    "Ignoring message for current phase"
                );
                LinkStep::Ignored
            }
        }
    }
}

/// Whether every target has delivered at least its counted shots.
fn counted_shots_delivered(targets: &[TargetConfig], shots: &[ShotEvent]) -> bool {
    !targets.is_empty()
        && targets.iter().all(|target| {
            target.counted_shots > 0
                && shots
                    .iter()
                    .filter(|shot| shot.device == target.target_name)
                    .count()
                    >= target.counted_shots as usize
        })
}

// ============================================================================
// Async driver
// ============================================================================

enum Wake {
    Event(Option<ChannelEvent>),
    Signal(Option<RepeatSignal>),
    Deadline,
}

async fn next_signal(signals: &mut Option<&mut SignalReceiver>) -> Option<RepeatSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct RepeatDriver<'a> {
    channel: &'a dyn MessageChannel,
    link: DrillLink,
    events: ChannelEvents,
    signals: Option<&'a mut SignalReceiver>,
    stop_requested: bool,
}

impl RepeatDriver<'_> {
    async fn wait(&mut self, deadline: Instant) -> Wake {
        tokio::select! {
            biased;
            signal = next_signal(&mut self.signals) => Wake::Signal(signal),
            event = self.events.recv() => Wake::Event(event),
            () = sleep_until(deadline) => Wake::Deadline,
        }
    }

    fn send(&self, message: &OutboundMessage) -> Result<(), LinkFailure> {
        self.channel.send(message).map_err(LinkFailure::from)
    }

    fn send_all(&self, messages: &[OutboundMessage]) -> Result<(), LinkFailure> {
        messages.iter().try_for_each(|message| self.send(message))
    }

    fn on_event(&mut self, event: Option<ChannelEvent>) -> Result<LinkStep, LinkFailure> {
        match event {
            Some(ChannelEvent::Message(payload)) => Ok(self.link.handle(&payload, Instant::now())),
            Some(ChannelEvent::DeviceDisconnected(device)) if self.link.has_target(&device) => {
                warn!(device = %device, "Drill target disconnected");
                Err(LinkFailure::Disconnected)
            }
            Some(ChannelEvent::DeviceDisconnected(device)) => {
                debug!(device = %device, "Ignoring disconnect of a device outside the drill");
                Ok(LinkStep::Ignored)
            }
            Some(ChannelEvent::Disconnected) | None => Err(LinkFailure::Disconnected),
        }
    }

    fn on_signal(&mut self, signal: Option<RepeatSignal>) -> Result<(), LinkFailure> {
        match signal {
            Some(RepeatSignal::Cancel) => Err(LinkFailure::Cancelled),
            Some(RepeatSignal::Stop) => {
                self.stop_requested = true;
                Ok(())
            }
            None => {
                self.signals = None;
                Ok(())
            }
        }
    }

    /// Applies events already queued when a stop arrived, so shots that
    /// landed before the stop still count.
    fn apply_queued_events(&mut self) -> Result<(), LinkFailure> {
        while let Ok(event) = self.events.try_recv() {
            self.on_event(Some(event))?;
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<DrillRepeatSummary, LinkFailure> {
        if !self.channel.is_connected() {
            return Err(LinkFailure::Disconnected);
        }

        let configs = self.link.configure();
        info!(targets = configs.len(), "Configuring targets");
        self.send_all(&configs)?;
        let readies = self.link.request_ready();
        self.send_all(&readies)?;

        let deadline = Instant::now() + self.link.settings().ready_ack_timeout();
        while self.link.phase() == LinkPhase::AwaitingReadyAcks {
            match self.wait(deadline).await {
                Wake::Deadline => return Err(self.link.ack_timeout_failure()),
                Wake::Event(event) => {
                    self.on_event(event)?;
                }
                Wake::Signal(signal) => self.on_signal(signal)?,
            }
        }

        let start = self
            .link
            .arm(Instant::now())
            .ok_or_else(|| {
                LinkFailure::Channel(format!("cannot start from {}", self.link.phase()))
            })?;
        self.send(&start)?;
        info!("Targets armed, drill running");

        let deadline = Instant::now() + self.link.settings().max_duration();
        while !self.stop_requested {
            match self.wait(deadline).await {
                Wake::Deadline => {
                    info!("Maximum drill duration reached");
                    break;
                }
                Wake::Event(event) => {
                    if self.on_event(event)? == (LinkStep::ShotRecorded { all_counted: true }) {
                        info!("Every target delivered its counted shots");
                        break;
                    }
                }
                Wake::Signal(signal) => self.on_signal(signal)?,
            }
        }
        if self.stop_requested {
            self.apply_queued_events()?;
        }

        let end = self
            .link
            .finish()
            .ok_or_else(|| LinkFailure::Channel(format!("cannot end from {}", self.link.phase())))?;
        self.send(&end)?;

        if self.link.pending_acks().is_empty() {
            return self
                .link
                .complete()
                .ok_or_else(|| LinkFailure::Channel("repeat left the end phase".into()));
        }

        let deadline = Instant::now() + self.link.settings().end_ack_grace();
        loop {
            match self.wait(deadline).await {
                Wake::Deadline => {
                    warn!(
                        missing = ?self.link.pending_acks(),
                        "End acknowledgement timed out, completing with collected shots"
                    );
                    return self
                        .link
                        .complete()
                        .ok_or_else(|| LinkFailure::Channel("repeat left the end phase".into()));
                }
                Wake::Event(event) => {
                    if let LinkStep::Completed(summary) = self.on_event(event)? {
                        return Ok(*summary);
                    }
                }
                Wake::Signal(signal) => self.on_signal(signal)?,
            }
        }
    }
}

/// Runs one repeat of `setup` over `channel` to a terminal state.
///
/// `repeat_index` is 1-based and is sent with the `start` command. Caller
/// signals are read from `signals` when given: `Stop` ends the running phase
/// (a stop that arrives earlier is applied once the repeat is running) and
/// `Cancel` aborts at any point.
///
/// # Errors
///
/// Returns the [`LinkFailure`] that moved the repeat to `Failed`; no summary
/// is produced in that case.
pub async fn run_repeat(
    channel: &dyn MessageChannel,
    setup: &DrillSetup,
    settings: &LinkSettings,
    repeat_index: u32,
    signals: Option<&mut SignalReceiver>,
) -> Result<DrillRepeatSummary, LinkFailure> {
    let mut driver = RepeatDriver {
        channel,
        link: DrillLink::new(setup, settings.clone(), repeat_index),
        events: channel.subscribe(),
        signals,
        stop_requested: false,
    };

    let span = tracing::info_span!("repeat", repeat = repeat_index, drill = %setup.name);
    let result = driver.drive().instrument(span).await;

    match &result {
        Ok(summary) => info!(
            repeat = repeat_index,
            shots = summary.shots.len(),
            score = summary.score,
            "Repeat completed"
        ),
        Err(failure) => {
            warn!(repeat = repeat_index, reason = %failure, "Repeat failed");
            driver.link.fail(failure.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DeviceEndpoint, MemoryChannel};
    use crate::types::TargetType;
    use crate::wire::ack_payload;
    use serde_json::json;
    use std::time::Duration;

    fn setup(names: &[&str]) -> DrillSetup {
        DrillSetup {
            name: "test drill".into(),
            mode: DrillMode::Ipsc,
            targets: names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    TargetConfig::new(u32::try_from(i).unwrap() + 1, *name, TargetType::Ipsc)
                })
                .collect(),
            repeats: 1,
        }
    }

    fn settings() -> LinkSettings {
        LinkSettings {
            auto_end_on_counted_shots: false,
            max_duration_secs: 30.0,
            ..LinkSettings::default()
        }
    }

    fn shot_payload(device: &str, area: &str, diff: f64) -> Value {
        ShotEvent::new(device, area, diff, "ipsc").to_wire()
    }

    /// Plays the device side: acks `ready`, fires `shots` on `start`, and
    /// acks `end` when `ack_end` is set. Returns everything it received.
    async fn simulate(
        mut device: DeviceEndpoint,
        ack_ready: Vec<&'static str>,
        shots: Vec<Value>,
        ack_end: bool,
    ) -> Vec<OutboundMessage> {
        let mut received = Vec::new();
        while let Some(message) = device.recv().await {
            match message.command() {
                Some(Command::Ready { .. }) => {
                    if let Some(dest) = message.dest() {
                        if ack_ready.contains(&dest) {
                            device.deliver(ack_payload(dest, AckKind::Ready));
                        }
                    }
                }
                Some(Command::Start { .. }) => {
                    for shot in &shots {
                        device.deliver(shot.clone());
                    }
                }
                Some(Command::End) if ack_end => {
                    for name in &ack_ready {
                        device.deliver(ack_payload(name, AckKind::End));
                    }
                }
                _ => {}
            }
            let done = matches!(message.command(), Some(Command::End));
            received.push(message);
            if done {
                break;
            }
        }
        received
    }

    #[test]
    fn test_configure_then_ready_in_sequence_order() {
        let mut drill = setup(&["b", "a", "c"]);
        drill.targets[0].sequence_number = 3;
        drill.targets[1].sequence_number = 1;
        drill.targets[2].sequence_number = 2;
        let mut link = DrillLink::new(&drill, settings(), 1);

        let configs = link.configure();
        assert_eq!(link.phase(), LinkPhase::Configuring);
        let order: Vec<_> = configs.iter().filter_map(OutboundMessage::dest).collect();
        assert_eq!(order, vec!["a", "c", "b"]);

        let readies = link.request_ready();
        assert_eq!(link.phase(), LinkPhase::AwaitingReadyAcks);
        let flags: Vec<_> = readies
            .iter()
            .map(|m| match m.command() {
                Some(Command::Ready {
                    is_first, is_last, ..
                }) => (*is_first, *is_last),
                _ => panic!("expected ready"),
            })
            .collect();
        assert_eq!(flags, vec![(true, false), (false, false), (false, true)]);
    }

    #[test]
    fn test_armed_only_after_every_distinct_ack() {
        let mut link = DrillLink::new(&setup(&["t1", "t2", "t3"]), settings(), 1);
        link.configure();
        link.request_ready();
        let now = Instant::now();

        assert_eq!(
            link.handle(&ack_payload("t3", AckKind::Ready), now),
            LinkStep::ReadyAck { remaining: 2 }
        );
        assert_eq!(link.handle(&ack_payload("t3", AckKind::Ready), now), LinkStep::Ignored);
        assert_eq!(link.handle(&ack_payload("stranger", AckKind::Ready), now), LinkStep::Ignored);
        assert_eq!(
            link.handle(&ack_payload("t1", AckKind::Ready), now),
            LinkStep::ReadyAck { remaining: 1 }
        );
        assert_eq!(link.phase(), LinkPhase::AwaitingReadyAcks);
        assert_eq!(link.handle(&ack_payload("t2", AckKind::Ready), now), LinkStep::Armed);
        assert_eq!(link.phase(), LinkPhase::Armed);
    }

    #[test]
    fn test_shots_ignored_outside_running() {
        let mut link = DrillLink::new(&setup(&["t1"]), settings(), 1);
        link.configure();
        link.request_ready();
        let now = Instant::now();
        assert_eq!(link.handle(&shot_payload("t1", "azone", 0.3), now), LinkStep::Ignored);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut link = DrillLink::new(&setup(&["t1"]), settings(), 1);
        link.fail(LinkFailure::Disconnected);
        link.fail(LinkFailure::Cancelled);
        assert!(matches!(link.state(), LinkState::Failed(LinkFailure::Disconnected)));
        assert!(link.configure().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_repeat_completes_with_score() {
        let (channel, device) = MemoryChannel::pair();
        let drill = setup(&["t1", "t2"]);
        let shots = vec![
            shot_payload("t2", "azone", 1.2),
            shot_payload("t1", "czone", 0.4),
            shot_payload("t2", "azone", 0.3),
            shot_payload("t1", "azone", 0.3),
        ];
        let device_task = tokio::spawn(simulate(device, vec!["t1", "t2"], shots, true));

        let mut signals_rx = {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let _ = tx.send(RepeatSignal::Stop);
            });
            rx
        };

        let summary = run_repeat(&channel, &drill, &settings(), 1, Some(&mut signals_rx))
            .await
            .unwrap();
        assert_eq!(summary.repeat_index, 1);
        assert_eq!(summary.shots.len(), 4);
        assert_eq!(summary.shots[0].device, "t2");
        assert_eq!(summary.score, 18);
        assert_eq!(summary.zone_counts.m, 0);

        let sent = device_task.await.unwrap();
        let starts: Vec<_> = sent
            .iter()
            .filter(|m| matches!(m.command(), Some(Command::Start { repeat: 1 })))
            .collect();
        assert_eq!(starts.len(), 1);
        assert_eq!(
            sent.iter()
                .filter(|m| matches!(m, OutboundMessage::AnimationConfig { .. }))
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ready_ack_times_out_without_start() {
        let (channel, mut device) = MemoryChannel::pair();
        let drill = setup(&["t1", "t2", "t3"]);

        let script = async {
            let mut acked = 0;
            while acked < 2 {
                if let Some(message) = device.recv().await {
                    let ready = matches!(message.command(), Some(Command::Ready { .. }));
                    if let (true, Some(dest)) = (ready, message.dest()) {
                        if dest != "t3" {
                            device.deliver(ack_payload(dest, AckKind::Ready));
                            acked += 1;
                        }
                    }
                }
            }
        };

        let settings = settings();
        let (result, ()) = tokio::join!(run_repeat(&channel, &drill, &settings, 1, None), script);
        assert_eq!(
            result,
            Err(LinkFailure::AckTimeout {
                missing: vec!["t3".to_string()]
            })
        );
        assert_eq!(result.unwrap_err().reason(), "ack timeout");
        assert!(device
            .drain()
            .iter()
            .all(|m| !matches!(m.command(), Some(Command::Start { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_ack_timeout_still_completes() {
        let (channel, device) = MemoryChannel::pair();
        let drill = setup(&["t1"]);
        let shots = vec![shot_payload("t1", "azone", 0.8), shot_payload("t1", "dzone", 0.5)];
        let device_task = tokio::spawn(simulate(device, vec!["t1"], shots, false));

        let mut settings = settings();
        settings.max_duration_secs = 2.0;

        let summary = run_repeat(&channel, &drill, &settings, 1, None).await.unwrap();
        assert_eq!(summary.shots.len(), 2);
        assert_eq!(summary.score, 6);
        device_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_end_after_counted_shots() {
        let (channel, device) = MemoryChannel::pair();
        let mut drill = setup(&["t1"]);
        drill.targets[0].counted_shots = 2;
        let shots = vec![
            shot_payload("t1", "azone", 0.8),
            shot_payload("t1", "azone", 0.5),
            shot_payload("t1", "azone", 0.5),
        ];
        let device_task = tokio::spawn(simulate(device, vec!["t1"], shots, true));

        let settings = LinkSettings {
            auto_end_on_counted_shots: true,
            ..settings()
        };
        let started = Instant::now();
        let summary = run_repeat(&channel, &drill, &settings, 1, None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(summary.shots.len() >= 2);
        device_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_shot_is_dropped() {
        let (channel, device) = MemoryChannel::pair();
        let drill = setup(&["t1"]);
        let shots = vec![
            json!({
                "device": "t1",
                "content": {"actualHitArea": "azone", "actualTimeDiff": "soon"}
            }),
            json!("garbage"),
            shot_payload("t1", "azone", 0.5),
        ];
        let device_task = tokio::spawn(simulate(device, vec!["t1"], shots, true));

        let mut settings = settings();
        settings.max_duration_secs = 1.0;
        let summary = run_repeat(&channel, &drill, &settings, 1, None).await.unwrap();
        assert_eq!(summary.shots.len(), 1);
        device_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_repeat() {
        let (channel, mut device) = MemoryChannel::pair();
        let drill = setup(&["t1"]);

        let script = async {
            while let Some(message) = device.recv().await {
                if matches!(message.command(), Some(Command::Ready { .. })) {
                    device.deliver(ack_payload("t1", AckKind::Ready));
                }
                if matches!(message.command(), Some(Command::Start { .. })) {
                    device.deliver(shot_payload("t1", "azone", 0.4));
                    device.drop_link();
                    break;
                }
            }
        };

        let settings = settings();
        let (result, ()) = tokio::join!(run_repeat(&channel, &drill, &settings, 1, None), script);
        assert_eq!(result, Err(LinkFailure::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_shots_already_received() {
        let (channel, mut device) = MemoryChannel::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let script = async {
            while let Some(message) = device.recv().await {
                match message.command() {
                    Some(Command::Ready { .. }) => {
                        device.deliver(ack_payload("t1", AckKind::Ready));
                    }
                    Some(Command::Start { .. }) => {
                        device.deliver(shot_payload("t1", "azone", 0.4));
                        device.deliver(shot_payload("t1", "dzone", 0.2));
                        tx.send(RepeatSignal::Stop).unwrap();
                    }
                    Some(Command::End) => break,
                    _ => {}
                }
            }
        };

        let drill = setup(&["t1"]);
        let settings = settings();
        let (result, ()) = tokio::join!(
            run_repeat(&channel, &drill, &settings, 1, Some(&mut rx)),
            script
        );
        let summary = result.unwrap();
        assert_eq!(summary.shots.len(), 2);
        assert_eq!(summary.shots[1].hit_area, crate::types::HitArea::Dzone);
    }

    /// Acks every ready, drops `leaving` once the drill starts and fires one
    /// shot from t1, then acks end for every target.
    async fn drop_device_on_start(device: &mut DeviceEndpoint, leaving: &str) {
        while let Some(message) = device.recv().await {
            match (message.command(), message.dest()) {
                (Some(Command::Ready { .. }), Some(dest)) => {
                    device.deliver(ack_payload(dest, AckKind::Ready));
                }
                (Some(Command::Start { .. }), _) => {
                    assert!(device.drop_device(leaving));
                    device.deliver(shot_payload("t1", "azone", 0.4));
                }
                (Some(Command::End), _) => {
                    device.deliver(ack_payload("t1", AckKind::End));
                    device.deliver(ack_payload("t2", AckKind::End));
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_target_device_loss_is_ignored() {
        let (channel, mut device) = MemoryChannel::pair();
        let drill = setup(&["t1", "t2"]);

        let settings = settings();
        let (result, ()) = tokio::join!(
            run_repeat(&channel, &drill, &settings, 1, None),
            drop_device_on_start(&mut device, "spectator")
        );
        let summary = result.unwrap();
        assert_eq!(summary.shots.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_device_loss_fails_repeat() {
        let (channel, mut device) = MemoryChannel::pair();
        let drill = setup(&["t1", "t2"]);

        let script = drop_device_on_start(&mut device, "t2");
        let settings = settings();
        let result = tokio::select! {
            result = run_repeat(&channel, &drill, &settings, 1, None) => result,
            () = script => panic!("device script ended first"),
        };
        assert_eq!(result, Err(LinkFailure::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_channel_fails_immediately() {
        let (channel, device) = MemoryChannel::pair();
        device.drop_link();
        let result = run_repeat(&channel, &setup(&["t1"]), &settings(), 1, None).await;
        assert_eq!(result, Err(LinkFailure::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_acks() {
        let (channel, _device) = MemoryChannel::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(RepeatSignal::Cancel).unwrap();

        let result = run_repeat(&channel, &setup(&["t1"]), &settings(), 1, Some(&mut rx)).await;
        assert_eq!(result, Err(LinkFailure::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_targets_runs_until_stopped() {
        let (channel, _device) = MemoryChannel::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(RepeatSignal::Stop).unwrap();

        let summary = run_repeat(&channel, &setup(&[]), &settings(), 2, Some(&mut rx))
            .await
            .unwrap();
        assert_eq!(summary.repeat_index, 2);
        assert!(summary.shots.is_empty());
        assert_eq!(summary.score, 0);
    }
}
