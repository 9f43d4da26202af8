//! Application configuration management.
//!
//! Handles loading, saving, and validating drillink configuration including:
//! - Link protocol timeouts and fan-out delay
//! - Session pacing between repeats
//! - Result storage location
//! - HTTP server binding
//! - BLE link parameters
//!
//! Configuration is layered with the `config` crate: built-in defaults, then
//! an optional TOML file, then `DRILLINK__SECTION__KEY` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DRILLINK";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file not found: {0}")]
    NotFound(String),

    /// The configuration sources could not be merged or deserialised.
    #[error("failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    /// The configuration file could not be written.
    #[error("failed to write {path}: {source}")]
    WriteError {
        /// Path that failed.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be serialised to TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field failed validation.
    #[error("invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

impl ConfigError {
    /// Shorthand for a [`ConfigError::ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Folds collected validation errors into a result.
    ///
    /// # Errors
    ///
    /// Returns the single error, or all of them wrapped, when any exist.
    pub fn collect(mut errors: Vec<Self>) -> ConfigResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::MultipleValidationErrors(errors)),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn secs(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

fn check_positive(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !value.is_finite() || value <= 0.0 {
        errors.push(ConfigError::validation(field, "must be a positive number of seconds"));
    }
}

fn check_non_negative(errors: &mut Vec<ConfigError>, field: &str, value: f64) {
    if !value.is_finite() || value < 0.0 {
        errors.push(ConfigError::validation(field, "must be zero or more seconds"));
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Timing of the per-repeat link protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// How long to wait for every target's `ready` acknowledgement.
    pub ready_ack_timeout_secs: f64,
    /// How long to wait for `end` acknowledgements before completing anyway.
    pub end_ack_grace_secs: f64,
    /// Upper bound on the running phase of a repeat.
    pub max_duration_secs: f64,
    /// Delay devices insert between consecutive targets.
    pub inter_target_delay_secs: f64,
    /// End the running phase once every target delivered its counted shots.
    pub auto_end_on_counted_shots: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            ready_ack_timeout_secs: 10.0,
            end_ack_grace_secs: 3.0,
            max_duration_secs: 120.0,
            inter_target_delay_secs: 0.0,
            auto_end_on_counted_shots: true,
        }
    }
}

impl LinkSettings {
    /// Ready-ack wait as a [`Duration`].
    #[must_use]
    pub fn ready_ack_timeout(&self) -> Duration {
        secs(self.ready_ack_timeout_secs, Duration::from_secs(10))
    }

    /// End-ack grace period as a [`Duration`].
    #[must_use]
    pub fn end_ack_grace(&self) -> Duration {
        secs(self.end_ack_grace_secs, Duration::from_secs(3))
    }

    /// Running-phase limit as a [`Duration`].
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        secs(self.max_duration_secs, Duration::from_secs(120))
    }

    fn validate_into(&self, errors: &mut Vec<ConfigError>) {
        check_positive(errors, "link.ready_ack_timeout_secs", self.ready_ack_timeout_secs);
        check_non_negative(errors, "link.end_ack_grace_secs", self.end_ack_grace_secs);
        check_positive(errors, "link.max_duration_secs", self.max_duration_secs);
        check_non_negative(errors, "link.inter_target_delay_secs", self.inter_target_delay_secs);
    }
}

/// Pacing of multi-repeat sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Pause between the end of one repeat and the start of the next.
    pub repeat_interval_secs: f64,
}

impl SessionSettings {
    /// Pause between repeats as a [`Duration`].
    #[must_use]
    pub fn repeat_interval(&self) -> Duration {
        secs(self.repeat_interval_secs, Duration::ZERO)
    }
}

/// Where repeat results are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Result directory; the platform data directory when unset.
    pub data_dir: Option<PathBuf>,
}

impl StorageSettings {
    /// Resolved result directory.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address to listen on.
    pub bind_address: String,
    /// Use production logging (JSON files plus compact stdout).
    pub production: bool,
    /// Directory for production log files; a platform default when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
            log_dir: None,
        }
    }
}

/// BLE link settings. All fields are required to use the BLE transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSettings {
    /// MAC address of the proxy device.
    pub address: Option<String>,
    /// GATT service carrying the link characteristics.
    pub service_uuid: Option<String>,
    /// Characteristic written with outbound commands.
    pub write_uuid: Option<String>,
    /// Characteristic notifying inbound payloads.
    pub notify_uuid: Option<String>,
}

impl BleSettings {
    /// Whether every BLE field is set.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.address.is_some()
            && self.service_uuid.is_some()
            && self.write_uuid.is_some()
            && self.notify_uuid.is_some()
    }

    fn validate_into(&self, errors: &mut Vec<ConfigError>) {
        for (field, value) in [
            ("ble.service_uuid", &self.service_uuid),
            ("ble.write_uuid", &self.write_uuid),
            ("ble.notify_uuid", &self.notify_uuid),
        ] {
            if let Some(value) = value {
                if uuid::Uuid::parse_str(value).is_err() {
                    errors.push(ConfigError::validation(field, format!("'{value}' is not a UUID")));
                }
            }
        }
    }
}

// ============================================================================
// Root configuration
// ============================================================================

/// Complete drillink configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrillinkConfig {
    /// Link protocol timing.
    pub link: LinkSettings,
    /// Session pacing.
    pub session: SessionSettings,
    /// Result storage.
    pub storage: StorageSettings,
    /// HTTP server.
    pub server: ServerSettings,
    /// Optional BLE transport.
    pub ble: BleSettings,
}

impl DrillinkConfig {
    /// Loads configuration from an optional file plus environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from an explicit file that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file is absent.
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load(Some(path))
    }

    /// Writes the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        let write_error = |source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        std::fs::write(path, content).map_err(write_error)
    }

    /// Validates every section, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the validation errors found.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        self.link.validate_into(&mut errors);
        check_non_negative(
            &mut errors,
            "session.repeat_interval_secs",
            self.session.repeat_interval_secs,
        );
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ConfigError::validation(
                "server.bind_address",
                format!("'{}' is not a socket address", self.server.bind_address),
            ));
        }
        self.ble.validate_into(&mut errors);
        ConfigError::collect(errors)
    }
}

/// Default configuration file location.
#[must_use]
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "drillink").map_or_else(
        || PathBuf::from("./drillink.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default directory for stored results.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "drillink").map_or_else(
        || PathBuf::from("./data"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
