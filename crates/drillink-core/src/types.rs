//! Shared domain types for drills, targets, shots and repeat summaries.
//!
//! These types are used by the scoring engine, the link protocol and the
//! HTTP layer alike, so they carry serde and OpenAPI derivations.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;

use crate::config::ConfigError;
use crate::cqb::CqbShotResult;
use crate::scoring::{ShotMetrics, ZoneCounts};

/// Pattern every target (device) name must match.
static TARGET_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\- ]{0,63}$").expect("target name pattern is valid")
});

/// Returns `true` if `name` is usable as a device identifier.
#[must_use]
pub fn is_valid_target_name(name: &str) -> bool {
    TARGET_NAME_REGEX.is_match(name)
}

// ============================================================================
// Target types
// ============================================================================

/// The kind of physical target a device drives.
///
/// Paper-like faces (`ipsc`, `hostage`, `rotation`, `special`) require two
/// valid hits; steel (`paddle`, `popper`) requires one. Tags that are not
/// recognised are kept verbatim so that CQB and future targets survive a
/// round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetType {
    Ipsc,
    Hostage,
    Rotation,
    Special,
    Paddle,
    Popper,
    TestTarget,
    Other(String),
}

impl TargetType {
    /// Canonical wire tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ipsc => "ipsc",
            Self::Hostage => "hostage",
            Self::Rotation => "rotation",
            Self::Special => "special",
            Self::Paddle => "paddle",
            Self::Popper => "popper",
            Self::TestTarget => "testTarget",
            Self::Other(tag) => tag,
        }
    }

    /// Steel targets fall with a single hit.
    #[must_use]
    pub const fn is_steel(&self) -> bool {
        matches!(self, Self::Paddle | Self::Popper)
    }

    /// Number of valid hits the shooter must land on this target.
    #[must_use]
    pub const fn required_hits(&self) -> u32 {
        if self.is_steel() {
            1
        } else {
            2
        }
    }
}

impl FromStr for TargetType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Ok(match trimmed.to_ascii_lowercase().as_str() {
            "ipsc" => Self::Ipsc,
            "hostage" => Self::Hostage,
            "rotation" => Self::Rotation,
            "special" | "special_1" | "special_2" => Self::Special,
            "paddle" => Self::Paddle,
            "popper" => Self::Popper,
            "testtarget" | "test_target" => Self::TestTarget,
            _ => Self::Other(trimmed.to_string()),
        })
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TargetType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TargetType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(tag.parse().unwrap_or(Self::Other(tag)))
    }
}

/// Accepts a single tag or an ordered list of tags.
#[derive(Deserialize)]
#[serde(untagged)]
enum TargetTypeTags {
    One(TargetType),
    Many(Vec<TargetType>),
}

fn deserialize_target_types<'de, D>(deserializer: D) -> Result<Vec<TargetType>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match TargetTypeTags::deserialize(deserializer)? {
        TargetTypeTags::One(tag) => vec![tag],
        TargetTypeTags::Many(tags) => tags,
    })
}

// ============================================================================
// Drill configuration
// ============================================================================

/// Scoring mode selected by the drill setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DrillMode {
    /// Zone scoring only.
    #[default]
    Ipsc,
    /// Zone scoring plus threat/non-threat validation.
    Cqb,
}

/// One target device participating in a drill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    /// Fan-out order of this target within the drill.
    pub sequence_number: u32,

    /// Device identifier, unique within a drill.
    #[schema(example = "target-1")]
    pub target_name: String,

    /// Type tags, primary first.
    #[serde(
        alias = "targetType",
        deserialize_with = "deserialize_target_types",
        default
    )]
    #[schema(value_type = Vec<String>, example = json!(["ipsc"]))]
    pub target_types: Vec<TargetType>,

    /// Seconds the device keeps the target presented.
    pub timeout_seconds: f64,

    /// Shots the target is expected to register.
    #[serde(default)]
    pub counted_shots: u32,

    /// Animation override sent in `animation_config`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_action: Option<String>,

    /// Animation duration override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_duration: Option<f64>,
}

impl TargetConfig {
    /// Creates a target with a single type tag.
    #[must_use]
    pub fn new(
        sequence_number: u32,
        target_name: impl Into<String>,
        target_type: TargetType,
    ) -> Self {
        Self {
            sequence_number,
            target_name: target_name.into(),
            target_types: vec![target_type],
            timeout_seconds: 30.0,
            counted_shots: 0,
            animation_action: None,
            animation_duration: None,
        }
    }

    /// Primary type tag. Targets without tags are treated as IPSC paper.
    #[must_use]
    pub fn target_type(&self) -> TargetType {
        self.target_types.first().cloned().unwrap_or(TargetType::Ipsc)
    }

    /// Valid hits required on this target.
    #[must_use]
    pub fn required_hits(&self) -> u32 {
        self.target_type().required_hits()
    }
}

/// A complete drill definition handed over by the setup layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrillSetup {
    /// Human-readable drill name.
    #[schema(example = "El Presidente")]
    pub name: String,

    /// Scoring mode.
    #[serde(default)]
    pub mode: DrillMode,

    /// Targets participating in the drill.
    pub targets: Vec<TargetConfig>,

    /// Number of repeats to run.
    #[serde(default = "default_repeats")]
    #[schema(minimum = 1)]
    pub repeats: u32,
}

const fn default_repeats() -> u32 {
    1
}

impl DrillSetup {
    /// Targets sorted by sequence number (stable for equal numbers).
    #[must_use]
    pub fn ordered_targets(&self) -> Vec<TargetConfig> {
        let mut targets = self.targets.clone();
        targets.sort_by_key(|t| t.sequence_number);
        targets
    }

    /// Validates the setup, collecting every problem found.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a single problem and
    /// [`ConfigError::MultipleValidationErrors`] when several were found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        if self.repeats == 0 {
            errors.push(ConfigError::validation("repeats", "must be at least 1"));
        }

        for target in &self.targets {
            let field = format!("targets.{}", target.target_name);
            if !is_valid_target_name(&target.target_name) {
                errors.push(ConfigError::validation(
                    field.clone(),
                    "target name must be 1-64 letters, digits, spaces or '_', '.', ':', '-'",
                ));
            }
            if !seen.insert(target.target_name.as_str()) {
                errors.push(ConfigError::validation(field.clone(), "duplicate target name"));
            }
            if !target.timeout_seconds.is_finite() || target.timeout_seconds <= 0.0 {
                errors.push(ConfigError::validation(
                    field,
                    "timeoutSeconds must be a positive number",
                ));
            }
        }

        ConfigError::collect(errors)
    }
}

// ============================================================================
// Shots
// ============================================================================

/// Classified hit area reported by a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HitArea {
    Azone,
    Czone,
    Dzone,
    Whitezone,
    Blackzone,
    Miss,
    Circlearea,
    Popperzone,
    Unknown,
}

impl HitArea {
    /// Classifies a raw hit-area string, trimmed and case-insensitive.
    #[must_use]
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "azone" | "a" => Self::Azone,
            "czone" | "c" => Self::Czone,
            "dzone" | "d" => Self::Dzone,
            "whitezone" => Self::Whitezone,
            "blackzone" => Self::Blackzone,
            "miss" | "m" => Self::Miss,
            "circlearea" => Self::Circlearea,
            "popperzone" => Self::Popperzone,
            _ => Self::Unknown,
        }
    }

    /// No-shoot zones are always penalised.
    #[must_use]
    pub const fn is_no_shoot(self) -> bool {
        matches!(self, Self::Whitezone | Self::Blackzone)
    }
}

/// A single hit notification received from a target device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(from = "ShotRecord", rename_all = "camelCase")]
pub struct ShotEvent {
    /// Name of the emitting target.
    pub device: String,
    /// Classification of `actual_hit_area`.
    pub hit_area: HitArea,
    /// Seconds since the previous shot or drill start, as reported.
    pub actual_time_diff: f64,
    /// Target type reported by the device.
    pub actual_target_type: String,
    /// Raw hit area reported by the device.
    pub actual_hit_area: String,
}

/// Deserialisation shape; `hit_area` is always derived.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShotRecord {
    device: String,
    #[serde(alias = "actual_time_diff")]
    actual_time_diff: f64,
    #[serde(default, alias = "actual_target_type")]
    actual_target_type: String,
    #[serde(alias = "actual_hit_area")]
    actual_hit_area: String,
}

impl From<ShotRecord> for ShotEvent {
    fn from(record: ShotRecord) -> Self {
        Self::new(
            record.device,
            record.actual_hit_area,
            record.actual_time_diff,
            record.actual_target_type,
        )
    }
}

impl ShotEvent {
    /// Creates a shot, classifying the raw hit area.
    #[must_use]
    pub fn new(
        device: impl Into<String>,
        actual_hit_area: impl Into<String>,
        actual_time_diff: f64,
        actual_target_type: impl Into<String>,
    ) -> Self {
        let actual_hit_area = actual_hit_area.into();
        Self {
            device: device.into(),
            hit_area: HitArea::classify(&actual_hit_area),
            actual_time_diff,
            actual_target_type: actual_target_type.into(),
            actual_hit_area,
        }
    }
}

// ============================================================================
// Repeat summaries
// ============================================================================

/// Result of one completed drill repeat.
///
/// Created once per repeat; only `drill_result_id` changes afterwards, when
/// the persistence layer assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrillRepeatSummary {
    /// 1-based repeat number within the session.
    pub repeat_index: u32,
    /// Seconds from the start command to the last received shot.
    pub total_time: f64,
    /// Shots in arrival order.
    pub shots: Vec<ShotEvent>,
    /// Clamped total score.
    pub score: i32,
    /// Effective zone counts used for `score`.
    pub zone_counts: ZoneCounts,
    /// Derived speed and accuracy metrics.
    pub metrics: ShotMetrics,
    /// Operator-corrected zone counts, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_hit_zones: Option<BTreeMap<String, u32>>,
    /// Per-target CQB cards (CQB drills only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cqb_results: Option<Vec<CqbShotResult>>,
    /// Overall CQB verdict (CQB drills only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cqb_passed: Option<bool>,
    /// Identifier assigned by the result store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drill_result_id: Option<String>,
    /// When the repeat reached its terminal state.
    pub completed_at: DateTime<Utc>,
}

impl DrillRepeatSummary {
    /// Back-fills the persisted result id.
    pub fn attach_result_id(&mut self, id: impl Into<String>) {
        self.drill_result_id = Some(id.into());
    }
}
