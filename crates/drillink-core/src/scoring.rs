//! Zone scoring for drill repeats.
//!
//! All functions here are pure: they map a shot list plus the drill's target
//! configuration to counts and metrics, and never fail. Empty input scores 0.
//!
//! # Scoring rules
//!
//! - Each target requires a number of valid hits (score > 0): one for steel,
//!   two for paper-like faces.
//! - Missing required hits are charged as misses (`M`).
//! - Paper targets only count their best `required` hits towards A/C/D.
//! - No-shoot hits (`whitezone`/`blackzone`) always count into `N`.
//! - Every configured target without a single valid hit adds one `PE`.
//!
//! `score = 5A + 3C + D - 15M - 10N - 10PE`, never below zero.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::cqb::{self, CqbDrillResult};
use crate::types::{DrillMode, DrillRepeatSummary, ShotEvent, TargetConfig, TargetType};

/// Points for an A-zone or steel hit.
pub const A_ZONE_POINTS: i32 = 5;
/// Points for a C-zone hit.
pub const C_ZONE_POINTS: i32 = 3;
/// Points for a D-zone hit.
pub const D_ZONE_POINTS: i32 = 1;
/// Penalty for a miss.
pub const MISS_PENALTY: i32 = -15;
/// Penalty for a no-shoot hit.
pub const NO_SHOOT_PENALTY: i32 = -10;
/// Penalty for a configured target never engaged successfully.
pub const MISSED_TARGET_PENALTY: i32 = -10;

/// Hit areas that count as misses for accuracy.
const MISS_AREAS: [&str; 3] = ["miss", "m", ""];

/// Returns the fixed point value for a raw hit area.
///
/// The lookup is trimmed and case-insensitive; unknown areas score 0.
#[must_use]
pub fn score_for_hit_area(area: &str) -> i32 {
    match area.trim().to_ascii_lowercase().as_str() {
        "azone" | "a" => A_ZONE_POINTS,
        "czone" | "c" => C_ZONE_POINTS,
        "dzone" | "d" => D_ZONE_POINTS,
        "miss" | "m" => MISS_PENALTY,
        "whitezone" | "blackzone" | "n" => NO_SHOOT_PENALTY,
        "circlearea" | "popperzone" => A_ZONE_POINTS,
        _ => 0,
    }
}

/// Effective per-zone counts after applying the required-hit rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ZoneCounts {
    #[serde(rename = "A")]
    pub a: u32,
    #[serde(rename = "C")]
    pub c: u32,
    #[serde(rename = "D")]
    pub d: u32,
    /// No-shoot hits.
    #[serde(rename = "N")]
    pub n: u32,
    /// Misses, including hits that were required but never landed.
    #[serde(rename = "M")]
    pub m: u32,
    /// Configured targets with no valid hit at all.
    #[serde(rename = "PE")]
    pub pe: u32,
}

impl ZoneCounts {
    /// Reads a manually adjusted zone map. Keys are matched case-insensitively;
    /// absent keys count as zero and unknown keys are ignored.
    #[must_use]
    pub fn from_zone_map(zones: &BTreeMap<String, u32>) -> Self {
        let mut counts = Self::default();
        for (zone, &count) in zones {
            match zone.trim().to_ascii_uppercase().as_str() {
                "A" => counts.a = count,
                "C" => counts.c = count,
                "D" => counts.d = count,
                "N" => counts.n = count,
                "M" => counts.m = count,
                "PE" => counts.pe = count,
                _ => {}
            }
        }
        counts
    }

    /// Converts back into the zone map shape used for manual adjustment.
    #[must_use]
    pub fn to_zone_map(&self) -> BTreeMap<String, u32> {
        [
            ("A", self.a),
            ("C", self.c),
            ("D", self.d),
            ("N", self.n),
            ("M", self.m),
            ("PE", self.pe),
        ]
        .into_iter()
        .map(|(zone, count)| (zone.to_string(), count))
        .collect()
    }

    /// Applies the score formula, clamped at zero.
    #[must_use]
    pub fn score(&self) -> i32 {
        let raw = i64::from(A_ZONE_POINTS) * i64::from(self.a)
            + i64::from(C_ZONE_POINTS) * i64::from(self.c)
            + i64::from(D_ZONE_POINTS) * i64::from(self.d)
            + i64::from(MISS_PENALTY) * i64::from(self.m)
            + i64::from(NO_SHOOT_PENALTY) * i64::from(self.n)
            + i64::from(MISSED_TARGET_PENALTY) * i64::from(self.pe);
        i32::try_from(raw.max(0)).unwrap_or(i32::MAX)
    }

    fn record_hit(&mut self, points: i32) {
        match points {
            A_ZONE_POINTS => self.a += 1,
            C_ZONE_POINTS => self.c += 1,
            D_ZONE_POINTS => self.d += 1,
            _ => {}
        }
    }
}

/// Shots of one target together with its hit requirement.
struct TargetShots<'a> {
    required: u32,
    steel: bool,
    shots: Vec<&'a ShotEvent>,
}

/// Groups shots by device: configured targets first in sequence order, then
/// devices that only appear in the shot list, in first-seen order.
fn group_by_target<'a>(shots: &'a [ShotEvent], targets: &[TargetConfig]) -> Vec<TargetShots<'a>> {
    let mut ordered: Vec<&TargetConfig> = targets.iter().collect();
    ordered.sort_by_key(|t| t.sequence_number);

    let mut groups = Vec::new();
    let mut seen = HashSet::new();

    for target in ordered {
        if !seen.insert(target.target_name.as_str()) {
            continue;
        }
        let target_type = target.target_type();
        groups.push(TargetShots {
            required: target_type.required_hits(),
            steel: target_type.is_steel(),
            shots: shots
                .iter()
                .filter(|s| s.device == target.target_name)
                .collect(),
        });
    }

    for shot in shots {
        if !seen.insert(shot.device.as_str()) {
            continue;
        }
        let target_type: TargetType = shot
            .actual_target_type
            .parse()
            .unwrap_or(TargetType::Ipsc);
        groups.push(TargetShots {
            required: target_type.required_hits(),
            steel: target_type.is_steel(),
            shots: shots.iter().filter(|s| s.device == shot.device).collect(),
        });
    }

    groups
}

/// Computes effective zone counts for a shot list.
#[must_use]
pub fn calculate_effective_counts(shots: &[ShotEvent], targets: &[TargetConfig]) -> ZoneCounts {
    let mut counts = ZoneCounts::default();

    for group in group_by_target(shots, targets) {
        let (no_shoot, others): (Vec<&ShotEvent>, Vec<&ShotEvent>) = group
            .shots
            .iter()
            .copied()
            .partition(|shot| shot.hit_area.is_no_shoot());
        counts.n += u32::try_from(no_shoot.len()).unwrap_or(u32::MAX);

        let mut valid: Vec<i32> = others
            .iter()
            .map(|shot| score_for_hit_area(&shot.actual_hit_area))
            .filter(|&points| points > 0)
            .collect();

        let valid_count = u32::try_from(valid.len()).unwrap_or(u32::MAX);
        counts.m += group.required.saturating_sub(valid_count);

        if !group.steel {
            valid.sort_unstable_by(|a, b| b.cmp(a));
            valid.truncate(group.required as usize);
        }
        for points in valid {
            counts.record_hit(points);
        }
    }

    counts.pe = calculate_missed_targets(shots, targets);
    counts
}

/// Counts configured targets that received no valid hit.
#[must_use]
pub fn calculate_missed_targets(shots: &[ShotEvent], targets: &[TargetConfig]) -> u32 {
    let engaged: HashSet<&str> = shots
        .iter()
        .filter(|shot| score_for_hit_area(&shot.actual_hit_area) > 0)
        .map(|shot| shot.device.as_str())
        .collect();

    let expected: BTreeSet<&str> = targets.iter().map(|t| t.target_name.as_str()).collect();
    let missed = expected.iter().filter(|name| !engaged.contains(*name)).count();
    u32::try_from(missed).unwrap_or(u32::MAX)
}

/// Total score for a shot list, never negative.
#[must_use]
pub fn calculate_total_score(shots: &[ShotEvent], targets: &[TargetConfig]) -> f64 {
    f64::from(calculate_effective_counts(shots, targets).score())
}

/// Scores an operator-adjusted zone map.
///
/// `PE` is capped at the number of configured targets since no more targets
/// than that can have been missed.
#[must_use]
pub fn calculate_score_from_adjusted_hit_zones(
    zones: &BTreeMap<String, u32>,
    targets: &[TargetConfig],
) -> i32 {
    let mut counts = ZoneCounts::from_zone_map(zones);
    let configured: BTreeSet<&str> = targets.iter().map(|t| t.target_name.as_str()).collect();
    counts.pe = counts
        .pe
        .min(u32::try_from(configured.len()).unwrap_or(u32::MAX));
    counts.score()
}

// ============================================================================
// Derived metrics
// ============================================================================

/// Speed and accuracy metrics derived from a shot list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShotMetrics {
    /// Smallest split, 0 without shots.
    pub fastest_shot: f64,
    /// Clamped total score.
    pub total_score: f64,
    /// Percentage of shots that were not misses.
    pub accuracy: f64,
    /// Reported total time, or the sum of splits when none was reported.
    pub effective_total_time: f64,
    /// Score per second.
    pub hit_factor: f64,
    /// Distinct reported target types, sorted.
    pub target_types: Vec<String>,
}

impl ShotMetrics {
    /// Computes every metric for a shot list.
    #[must_use]
    pub fn compute(
        shots: &[ShotEvent],
        targets: &[TargetConfig],
        reported_total_time: f64,
    ) -> Self {
        let total_score = calculate_total_score(shots, targets);
        let effective_total_time = effective_total_time(shots, reported_total_time);
        Self {
            fastest_shot: fastest_shot(shots),
            total_score,
            accuracy: accuracy(shots),
            effective_total_time,
            hit_factor: hit_factor(total_score, effective_total_time),
            target_types: target_types(shots),
        }
    }
}

/// Smallest reported split, or 0 for an empty list.
#[must_use]
pub fn fastest_shot(shots: &[ShotEvent]) -> f64 {
    shots
        .iter()
        .map(|shot| shot.actual_time_diff)
        .reduce(f64::min)
        .unwrap_or(0.0)
}

/// Share of non-miss shots as a percentage.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn accuracy(shots: &[ShotEvent]) -> f64 {
    if shots.is_empty() {
        return 0.0;
    }
    let hits = shots
        .iter()
        .filter(|shot| {
            let area = shot.actual_hit_area.trim().to_ascii_lowercase();
            !MISS_AREAS.contains(&area.as_str())
        })
        .count();
    hits as f64 / shots.len() as f64 * 100.0
}

/// Reported total time when positive, otherwise the sum of splits.
#[must_use]
pub fn effective_total_time(shots: &[ShotEvent], reported_total_time: f64) -> f64 {
    if reported_total_time > 0.0 {
        reported_total_time
    } else {
        shots.iter().map(|shot| shot.actual_time_diff).sum()
    }
}

/// Score divided by time, 0 when no time elapsed.
#[must_use]
pub fn hit_factor(total_score: f64, effective_total_time: f64) -> f64 {
    if effective_total_time > 0.0 {
        total_score / effective_total_time
    } else {
        0.0
    }
}

/// Distinct non-empty target types reported by the shots, sorted.
#[must_use]
pub fn target_types(shots: &[ShotEvent]) -> Vec<String> {
    shots
        .iter()
        .map(|shot| shot.actual_target_type.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ============================================================================
// Repeat summary
// ============================================================================

/// Scores a finished repeat and packages it as a summary.
///
/// CQB validation runs in addition to zone scoring when `mode` is CQB.
#[must_use]
pub fn summarize_repeat(
    repeat_index: u32,
    mode: DrillMode,
    targets: &[TargetConfig],
    shots: Vec<ShotEvent>,
    total_time: f64,
) -> DrillRepeatSummary {
    let zone_counts = calculate_effective_counts(&shots, targets);
    let metrics = ShotMetrics::compute(&shots, targets, total_time);

    let cqb = match mode {
        DrillMode::Cqb => {
            let names: Vec<&str> = targets.iter().map(|t| t.target_name.as_str()).collect();
            Some(cqb::validate_drill(&shots, &names, metrics.effective_total_time))
        }
        DrillMode::Ipsc => None,
    };
    let (cqb_results, cqb_passed) = match cqb {
        Some(CqbDrillResult {
            shot_results,
            drill_passed,
            ..
        }) => (Some(shot_results), Some(drill_passed)),
        None => (None, None),
    };

    DrillRepeatSummary {
        repeat_index,
        total_time,
        score: zone_counts.score(),
        zone_counts,
        metrics,
        shots,
        adjusted_hit_zones: None,
        cqb_results,
        cqb_passed,
        drill_result_id: None,
        completed_at: Utc::now(),
    }
}
