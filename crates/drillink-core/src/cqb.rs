//! Pass/fail validation for close-quarters-battle drills.
//!
//! CQB drills do not use ring zones. Each target is either a threat, which
//! must take at least two head or body hits, or a non-threat, which must
//! not be shot at all. Targets outside both sets are ignored.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::types::ShotEvent;

/// Target names that represent threats.
pub const THREAT_TARGETS: [&str; 4] = ["cqb_moving", "cqb_front", "cqb_swing", "disguised_enemy"];

/// Target names that represent non-threats.
pub const NON_THREAT_TARGETS: [&str; 2] = ["disguised_enemy_surrender", "cqb_hostage"];

/// Valid hits a threat target needs.
pub const REQUIRED_THREAT_HITS: u32 = 2;

/// Outcome card for a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Green,
    Red,
}

/// How a target is treated by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqbRole {
    Threat,
    NonThreat,
}

impl CqbRole {
    /// Classifies a target name, case-insensitively. `None` means ignored.
    #[must_use]
    pub fn of(target_name: &str) -> Option<Self> {
        let name = target_name.to_ascii_lowercase();
        if THREAT_TARGETS.contains(&name.as_str()) {
            Some(Self::Threat)
        } else if NON_THREAT_TARGETS.contains(&name.as_str()) {
            Some(Self::NonThreat)
        } else {
            None
        }
    }
}

/// Validation result for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CqbShotResult {
    pub target_name: String,
    pub is_threat: bool,
    pub expected_shots: u32,
    /// Head/body hits on threats; every shot on non-threats.
    pub actual_valid_shots: u32,
    pub card_status: CardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Validation result for a whole CQB repeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CqbDrillResult {
    pub shot_results: Vec<CqbShotResult>,
    pub drill_passed: bool,
    pub total_shots: u32,
    pub drill_duration: f64,
}

/// Returns `true` for anatomical zones that count on CQB targets.
#[must_use]
pub fn is_valid_cqb_hit(hit_area: &str) -> bool {
    matches!(hit_area.trim().to_ascii_lowercase().as_str(), "head" | "body")
}

fn plural(count: u32, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Evaluates a single target against its shots.
#[must_use]
pub fn evaluate_target(target_name: &str, role: CqbRole, shots: &[&ShotEvent]) -> CqbShotResult {
    match role {
        CqbRole::Threat => {
            let valid = count_u32(
                shots
                    .iter()
                    .filter(|shot| is_valid_cqb_hit(&shot.actual_hit_area))
                    .count(),
            );
            let passed = valid >= REQUIRED_THREAT_HITS;
            CqbShotResult {
                target_name: target_name.to_string(),
                is_threat: true,
                expected_shots: REQUIRED_THREAT_HITS,
                actual_valid_shots: valid,
                card_status: if passed { CardStatus::Green } else { CardStatus::Red },
                failure_reason: (!passed).then(|| {
                    format!("Missed {}", plural(REQUIRED_THREAT_HITS - valid, "shot"))
                }),
            }
        }
        CqbRole::NonThreat => {
            let total = count_u32(shots.len());
            let passed = total == 0;
            CqbShotResult {
                target_name: target_name.to_string(),
                is_threat: false,
                expected_shots: 0,
                actual_valid_shots: total,
                card_status: if passed { CardStatus::Green } else { CardStatus::Red },
                failure_reason: (!passed)
                    .then(|| format!("Shot non-threat target ({})", plural(total, "shot"))),
            }
        }
    }
}

/// Validates a CQB repeat.
///
/// `target_names` is the drill's device list; results follow its order and
/// duplicates are evaluated once.
#[must_use]
pub fn validate_drill(
    shots: &[ShotEvent],
    target_names: &[&str],
    drill_duration: f64,
) -> CqbDrillResult {
    let mut seen = HashSet::new();
    let mut shot_results = Vec::new();

    for &name in target_names {
        if !seen.insert(name) {
            continue;
        }
        let Some(role) = CqbRole::of(name) else {
            tracing::debug!(target_name = name, "Ignoring target outside CQB threat sets");
            continue;
        };
        let target_shots: Vec<&ShotEvent> = shots.iter().filter(|s| s.device == name).collect();
        shot_results.push(evaluate_target(name, role, &target_shots));
    }

    CqbDrillResult {
        drill_passed: shot_results
            .iter()
            .all(|result| result.card_status == CardStatus::Green),
        shot_results,
        total_shots: count_u32(shots.len()),
        drill_duration,
    }
}
