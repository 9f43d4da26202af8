//! # drillink-core
//!
//! Core logic for driving networked shooting targets through timed drills.
//!
//! This crate provides:
//! - The per-repeat link protocol (configure, ready, start, end) with
//!   acknowledgement tracking and timeouts
//! - Multi-repeat drill sessions with stop/cancel control
//! - Zone scoring (IPSC-style) and CQB pass/fail validation
//! - Transports for the protocol and persistent storage for results
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Target configuration, shots and repeat summaries
//! - [`scoring`] - Deterministic zone scoring and derived metrics
//! - [`cqb`] - Close-quarters drill validation
//! - [`wire`] - JSON message vocabulary shared with target devices
//! - [`channel`] - Transport abstraction and in-memory transport
//! - [`link`] - Drill link state machine and its async driver
//! - [`session`] - Sequential repeats, observers and caller control
//! - [`storage`] - Persistent storage for drill results using JSON files
//! - [`config`] - Application configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - `ble` - BLE write/notify transport (feature `bluetooth`)

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

#[cfg(feature = "bluetooth")]
pub mod ble;
pub mod channel;
pub mod config;
pub mod cqb;
pub mod error;
pub mod link;
pub mod scoring;
pub mod session;
pub mod storage;
pub mod types;
pub mod wire;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use ble::{BleChannel, BleError};
pub use channel::{
    ChannelError, ChannelEvent, ChannelEvents, DeviceEndpoint, MemoryChannel, MessageChannel,
};
pub use config::{
    default_config_path, default_data_dir, BleSettings, ConfigError, ConfigResult, DrillinkConfig,
    LinkSettings, ServerSettings, SessionSettings, StorageSettings,
};
pub use cqb::{CardStatus, CqbDrillResult, CqbShotResult};
pub use error::{DrillError, Result};
pub use link::{run_repeat, DrillLink, LinkFailure, LinkPhase, LinkState, LinkStep, RepeatSignal};
pub use scoring::{
    calculate_effective_counts, calculate_missed_targets, calculate_score_from_adjusted_hit_zones,
    calculate_total_score, score_for_hit_area, summarize_repeat, ShotMetrics, ZoneCounts,
};
pub use session::{DrillSession, SessionFailure, SessionHandle, SessionObserver};
pub use storage::{JsonResultStore, ResultStore, StorageError, StoredResult};
pub use types::{
    is_valid_target_name, DrillMode, DrillRepeatSummary, DrillSetup, HitArea, ShotEvent,
    TargetConfig, TargetType,
};
pub use wire::{InboundMessage, OutboundMessage, WireError};
