//! Unified error types for the drillink core library.
//!
//! This module provides a unified error type [`DrillError`] that covers all
//! failure modes across the system. Each module also has its own specific
//! error type (`ConfigError`, `StorageError`, `LinkFailure`) for internal
//! use.
//!
//! Only two failures are actionable for a shooter: an ack timeout (retry the
//! repeat) and a lost link (reconnect). Everything else either degrades to a
//! best-effort result inside the protocol or is a setup problem.
//!
//! # Example
//!
//! ```rust
//! use drillink_core::error::{DrillError, Result};
//!
//! fn require_targets(count: usize) -> Result<()> {
//!     if count == 0 {
//!         return Err(DrillError::InvalidSetup("drill has no targets".into()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::config::ConfigError;
use crate::link::LinkFailure;
use crate::storage::StorageError;

/// The unified error type for all drillink operations.
#[derive(Debug, Error)]
pub enum DrillError {
    // =========================================================================
    // LINK ERRORS
    // =========================================================================
    /// Not every target acknowledged `ready` in time.
    #[error("ack timeout: no ready acknowledgement from {}", .0.join(", "))]
    AckTimeout(Vec<String>),

    /// The transport to the targets went down.
    #[error("disconnected: the link to the targets was lost")]
    Disconnected,

    /// The caller cancelled the drill.
    #[error("cancelled")]
    Cancelled,

    /// The transport rejected a message.
    #[error("channel error: {0}")]
    Channel(String),

    // =========================================================================
    // SETUP & CONFIGURATION ERRORS
    // =========================================================================
    /// The drill setup is unusable.
    #[error("invalid drill setup: {0}")]
    InvalidSetup(String),

    /// A drill session is already running on this channel.
    #[error("a drill session is already running")]
    SessionBusy,

    /// The configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    // =========================================================================
    // PERSISTENCE ERRORS
    // =========================================================================
    /// A stored result does not exist.
    #[error("result not found: {0}")]
    ResultNotFound(String),

    /// Reading or writing results failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// A specialized [`Result`] type for drillink operations.
pub type Result<T> = std::result::Result<T, DrillError>;

impl DrillError {
    /// Returns `true` for failures the caller should surface with a
    /// retry/reconnect option: ack timeouts and transport loss.
    #[inline]
    #[must_use]
    pub const fn is_actionable(&self) -> bool {
        matches!(self, Self::AckTimeout(_) | Self::Disconnected)
    }

    /// Returns `true` if the drill ended because the caller cancelled it.
    #[inline]
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if this error is related to the device link.
    #[inline]
    #[must_use]
    pub const fn is_link_error(&self) -> bool {
        matches!(
            self,
            Self::AckTimeout(_) | Self::Disconnected | Self::Cancelled | Self::Channel(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidSetup(_) => 400,
            Self::ResultNotFound(_) => 404,
            Self::SessionBusy => 409,
            Self::Cancelled => 499,
            Self::Config(_) | Self::Persistence(_) => 500,
            Self::Disconnected | Self::Channel(_) => 503,
            Self::AckTimeout(_) => 504,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::AckTimeout(_) => "ACK_TIMEOUT",
            Self::Disconnected => "DISCONNECTED",
            Self::Cancelled => "CANCELLED",
            Self::Channel(_) => "CHANNEL_ERROR",
            Self::InvalidSetup(_) => "INVALID_SETUP",
            Self::SessionBusy => "SESSION_BUSY",
            Self::Config(_) => "CONFIG_ERROR",
            Self::ResultNotFound(_) => "RESULT_NOT_FOUND",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<LinkFailure> for DrillError {
    fn from(failure: LinkFailure) -> Self {
        match failure {
            LinkFailure::AckTimeout { missing } => Self::AckTimeout(missing),
            LinkFailure::Disconnected => Self::Disconnected,
            LinkFailure::Cancelled => Self::Cancelled,
            LinkFailure::Channel(message) => Self::Channel(message),
        }
    }
}

impl From<StorageError> for DrillError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => Self::ResultNotFound(id),
            other => Self::Persistence(other.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
