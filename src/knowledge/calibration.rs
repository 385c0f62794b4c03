//! Weekly agreement between generated scores and community consensus.

use chrono::{DateTime, Datelike, Utc};

use super::mean;
use crate::storage::{CalibrationSnapshot, OutcomeRecord};

/// Records scanned per snapshot.
pub const CALIBRATION_WINDOW: i64 = 500;
/// Paired records required for a snapshot.
pub const MIN_PAIRS: usize = 10;

/// Pearson correlation coefficient, or `None` when undefined.
pub fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    let n = pairs.len() as f64;
    if pairs.len() < 2 {
        return None;
    }

    let (mut sx, mut sy, mut sxy, mut sx2, mut sy2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for &(x, y) in pairs {
        sx += x;
        sy += y;
        sxy += x * y;
        sx2 += x * x;
        sy2 += y * y;
    }

    let numerator = n * sxy - sx * sy;
    let denominator = ((n * sx2 - sx * sx) * (n * sy2 - sy * sy)).sqrt();
    if denominator == 0.0 || denominator.is_nan() {
        return None;
    }
    Some(numerator / denominator)
}

/// ISO week label for `at`, e.g. `2026-W07`.
pub fn week_period(at: DateTime<Utc>) -> String {
    let week = at.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Build a snapshot for `period` from records with a score and trusted consensus.
///
/// Returns `None` when fewer than [`MIN_PAIRS`] such records exist.
pub fn build_snapshot(records: &[OutcomeRecord], period: String) -> Option<CalibrationSnapshot> {
    let pairs: Vec<(f64, f64)> = records
        .iter()
        .filter_map(|r| Some((r.score?, r.trusted_community()?)))
        .collect();
    if pairs.len() < MIN_PAIRS {
        return None;
    }

    let scores: Vec<f64> = pairs.iter().map(|p| p.0).collect();
    let community: Vec<f64> = pairs.iter().map(|p| p.1).collect();
    let avg_score = mean(&scores)?;
    let avg_community = mean(&community)?;

    Some(CalibrationSnapshot {
        period,
        sample_size: pairs.len() as i64,
        avg_score,
        avg_community,
        delta: avg_score - avg_community,
        correlation: pearson(&pairs),
        created_at: Utc::now(),
    })
}
