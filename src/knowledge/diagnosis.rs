//! Weakness diagnosis over recent outcomes and calibration history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::mean;
use crate::storage::{CalibrationSnapshot, OutcomeRecord};

const MIN_CATEGORY_RATINGS: usize = 3;
const LOW_RATING: f64 = 3.5;
const MIN_CATEGORY_DELTAS: usize = 3;
const MISCALIBRATION: f64 = 1.0;
const MIN_UNHELPFUL: usize = 5;
const DRIFT_MARGIN: f64 = 0.3;
const MIN_CORRELATION: f64 = 0.5;

/// What the next variant should fix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeaknessReport {
    pub weaknesses: Vec<String>,
    pub low_performing: Vec<String>,
    pub calibration_issues: Vec<String>,
}

impl WeaknessReport {
    /// True when nothing was found.
    pub fn is_empty(&self) -> bool {
        self.weaknesses.is_empty() && self.calibration_issues.is_empty()
    }
}

#[derive(Default)]
struct CategoryStats {
    ratings: Vec<f64>,
    deltas: Vec<f64>,
}

/// Diagnose weaknesses from recent records and snapshots (newest first).
pub fn diagnose(records: &[OutcomeRecord], snapshots: &[CalibrationSnapshot]) -> WeaknessReport {
    let mut report = WeaknessReport::default();

    let mut by_category: BTreeMap<&str, CategoryStats> = BTreeMap::new();
    for record in records {
        for category in &record.categories {
            let stats = by_category.entry(category.as_str()).or_default();
            if let Some(rating) = record.user_rating {
                stats.ratings.push(rating as f64);
            }
            if let Some(delta) = record.signed_community_delta() {
                stats.deltas.push(delta);
            }
        }
    }

    for (category, stats) in &by_category {
        if stats.ratings.len() >= MIN_CATEGORY_RATINGS {
            if let Some(avg) = mean(&stats.ratings).filter(|avg| *avg < LOW_RATING) {
                report.low_performing.push(category.to_string());
                report.weaknesses.push(format!(
                    "\"{}\" outfits have low user satisfaction (avg rating {:.1}/5, n={})",
                    category,
                    avg,
                    stats.ratings.len()
                ));
            }
        }
        if stats.deltas.len() >= MIN_CATEGORY_DELTAS {
            if let Some(avg) = mean(&stats.deltas).filter(|avg| avg.abs() > MISCALIBRATION) {
                let direction = if avg > 0.0 { "higher" } else { "lower" };
                report.calibration_issues.push(format!(
                    "Scores run {:.1} points {} than the community for \"{}\" outfits",
                    avg.abs(),
                    direction,
                    category
                ));
            }
        }
    }

    let unhelpful = records
        .iter()
        .filter(|r| r.helpful == Some(false) || r.user_rating.is_some_and(|x| x <= 2))
        .count();
    if unhelpful >= MIN_UNHELPFUL {
        report.weaknesses.push(format!(
            "{:.1}% of recent feedback rated unhelpful or <= 2 stars ({}/{})",
            unhelpful as f64 / records.len() as f64 * 100.0,
            unhelpful,
            records.len()
        ));
    }

    if let [latest, previous, ..] = snapshots {
        if latest.delta.abs() > previous.delta.abs() + DRIFT_MARGIN {
            report.calibration_issues.push(format!(
                "Calibration drift increasing: delta went from {:.2} to {:.2}",
                previous.delta, latest.delta
            ));
        }
        if let Some(r) = latest.correlation.filter(|r| *r < MIN_CORRELATION) {
            report.calibration_issues.push(format!(
                "Low score-community correlation (r={:.3}); generated opinions are diverging from users",
                r
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rated(category: &str, rating: i64) -> OutcomeRecord {
        OutcomeRecord::new("v1", Some(7.0))
            .with_categories(vec![category.to_string()])
            .with_rating(Some(rating), None)
    }

    fn snapshot(delta: f64, correlation: Option<f64>) -> CalibrationSnapshot {
        CalibrationSnapshot {
            period: "2026-W01".to_string(),
            sample_size: 20,
            avg_score: 7.0,
            avg_community: 7.0 - delta,
            delta,
            correlation,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_low_satisfaction_category() {
        let records = vec![rated("wedding", 3), rated("wedding", 3), rated("wedding", 4), rated("work", 5)];
        let report = diagnose(&records, &[]);

        assert_eq!(report.low_performing, vec!["wedding"]);
        assert_eq!(
            report.weaknesses,
            vec!["\"wedding\" outfits have low user satisfaction (avg rating 3.3/5, n=3)"]
        );
        assert!(report.calibration_issues.is_empty());
    }

    #[test]
    fn test_category_calibration() {
        let records: Vec<_> = (0..3)
            .map(|_| {
                OutcomeRecord::new("v1", Some(8.0))
                    .with_categories(vec!["gym".to_string()])
                    .with_community(6.5, 4)
            })
            .collect();
        let report = diagnose(&records, &[]);
        assert_eq!(
            report.calibration_issues,
            vec!["Scores run 1.5 points higher than the community for \"gym\" outfits"]
        );
    }

    #[test]
    fn test_unhelpful_share() {
        let mut records: Vec<_> = (0..5)
            .map(|_| OutcomeRecord::new("v1", Some(6.0)).with_rating(None, Some(false)))
            .collect();
        records.extend((0..5).map(|_| OutcomeRecord::new("v1", Some(6.0))));

        let report = diagnose(&records, &[]);
        assert_eq!(
            report.weaknesses,
            vec!["50.0% of recent feedback rated unhelpful or <= 2 stars (5/10)"]
        );
    }

    #[test]
    fn test_snapshot_drift_and_correlation() {
        let report = diagnose(&[], &[snapshot(0.9, Some(0.42)), snapshot(0.4, Some(0.7))]);
        assert_eq!(report.calibration_issues.len(), 2);
        assert!(report.calibration_issues[0].contains("from 0.40 to 0.90"));
        assert!(report.calibration_issues[1].contains("r=0.420"));
        assert!(!report.is_empty());

        // A single snapshot has nothing to compare against
        assert!(diagnose(&[], &[snapshot(3.0, Some(0.1))]).is_empty());
    }
}
