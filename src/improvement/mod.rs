//! The self-improvement loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │  ┌─────────┐  ┌──────────┐  ┌──────────┐  ┌─────────┐  ┌────┐ │
//! │  │ Measure │─►│ Discover │─►│ Diagnose │─►│ Improve │─►│Deploy│
//! │  └─────────┘  └──────────┘  └──────────┘  └─────────┘  └────┘ │
//! │       │        KnowledgeMiner              MetaGenerator  │   │
//! │       │                                                   ▼   │
//! │       │                                     VariantRegistry   │
//! │       └──────── DecisionEngine (evaluate, tick) ◄─────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each run is recorded as an [`ImprovementCycle`](crate::storage::ImprovementCycle)
//! and guarded by a database lease so overlapping schedulers cannot run two
//! cycles at once.
//!
//! The cohort cycle runs separately under its own lease: it specializes the
//! live variant for large clusters of users who share a style.

pub mod cohort;
pub mod meta;
pub mod orchestrator;

pub use cohort::{CohortGenerator, CohortReport, CohortSkip, COHORT_LEASE};
pub use meta::{validate_candidate, MetaCandidate, MetaGenerator};
pub use orchestrator::{Orchestrator, TickOutcome, CYCLE_LEASE};

use serde::{Deserialize, Serialize};

use crate::config::QualityDropThresholds;
use crate::knowledge::mean;
use crate::storage::OutcomeRecord;

/// Aggregate quality of recent outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub version: String,
    pub sample_size: usize,
    pub avg_score: Option<f64>,
    pub avg_user_rating: Option<f64>,
    /// Mean |score - consensus| over records with trusted consensus.
    pub avg_community_delta: Option<f64>,
    /// Fraction of helpful votes that were positive.
    pub helpful_rate: Option<f64>,
    pub fallback_rate: Option<f64>,
}

impl PerformanceMetrics {
    /// Summarize `records` for `version`.
    pub fn from_records(version: impl Into<String>, records: &[OutcomeRecord]) -> Self {
        let scores: Vec<f64> = records.iter().filter_map(|r| r.score).collect();
        let ratings: Vec<f64> = records
            .iter()
            .filter_map(|r| r.user_rating.map(|x| x as f64))
            .collect();
        let deltas: Vec<f64> = records.iter().filter_map(OutcomeRecord::community_delta).collect();
        let votes: Vec<f64> = records
            .iter()
            .filter_map(|r| r.helpful.map(|h| if h { 1.0 } else { 0.0 }))
            .collect();

        let fallback_rate = if records.is_empty() {
            None
        } else {
            Some(records.iter().filter(|r| r.is_fallback).count() as f64 / records.len() as f64)
        };

        Self {
            version: version.into(),
            sample_size: records.len(),
            avg_score: mean(&scores),
            avg_user_rating: mean(&ratings),
            avg_community_delta: mean(&deltas),
            helpful_rate: mean(&votes),
            fallback_rate,
        }
    }

    /// Thresholds this measurement violates, as readable reasons.
    pub fn quality_drop_reasons(&self, t: &QualityDropThresholds) -> Vec<String> {
        let mut reasons = Vec::new();
        if let Some(r) = self.avg_user_rating.filter(|r| *r < t.min_avg_rating) {
            reasons.push(format!("avg rating {:.2} < {:.2}", r, t.min_avg_rating));
        }
        if let Some(d) = self.avg_community_delta.filter(|d| *d > t.max_avg_delta) {
            reasons.push(format!("avg community delta {:.2} > {:.2}", d, t.max_avg_delta));
        }
        if let Some(h) = self.helpful_rate.filter(|h| *h < t.min_helpful_rate) {
            reasons.push(format!("helpful rate {:.2} < {:.2}", h, t.min_helpful_rate));
        }
        if let Some(f) = self.fallback_rate.filter(|f| *f > t.max_fallback_rate) {
            reasons.push(format!("fallback rate {:.2} > {:.2}", f, t.max_fallback_rate));
        }
        reasons
    }

    /// Metrics block for the meta-generation prompt and cycle log.
    pub fn summary_lines(&self) -> Vec<String> {
        let fmt = |v: Option<f64>, digits: usize| match v {
            Some(x) => format!("{:.*}", digits, x),
            None => "N/A".to_string(),
        };
        vec![
            format!("- Sample size: {}", self.sample_size),
            format!("- Avg score given: {}", fmt(self.avg_score, 1)),
            format!("- Avg user rating: {}/5", fmt(self.avg_user_rating, 2)),
            format!(
                "- Avg |score - community| delta: {} (lower is better)",
                fmt(self.avg_community_delta, 2)
            ),
            format!(
                "- Marked helpful: {}",
                self.helpful_rate
                    .map(|h| format!("{:.1}%", h * 100.0))
                    .unwrap_or_else(|| "N/A".to_string())
            ),
            format!(
                "- Fallback rate: {:.1}%",
                self.fallback_rate.unwrap_or(0.0) * 100.0
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_from_records() {
        let records = vec![
            OutcomeRecord::new("v1", Some(8.0))
                .with_rating(Some(4), Some(true))
                .with_community(6.0, 5),
            OutcomeRecord::new("v1", Some(6.0)).with_rating(Some(2), Some(false)),
            OutcomeRecord::new("v1", Some(7.0)).with_community(9.0, 1),
            OutcomeRecord::new("v1", Some(7.0)).as_fallback(),
        ];
        let m = PerformanceMetrics::from_records("v1", &records);

        assert_eq!(m.sample_size, 4);
        assert_eq!(m.avg_score, Some(7.0));
        assert_eq!(m.avg_user_rating, Some(3.0));
        assert_eq!(m.avg_community_delta, Some(2.0));
        assert_eq!(m.helpful_rate, Some(0.5));
        assert_eq!(m.fallback_rate, Some(0.25));

        let reasons = m.quality_drop_reasons(&QualityDropThresholds::default());
        assert_eq!(reasons.len(), 4);
    }

    #[test]
    fn test_empty_metrics() {
        let m = PerformanceMetrics::from_records("v1", &[]);
        assert_eq!(m.sample_size, 0);
        assert!(m.avg_user_rating.is_none());
        assert!(m.fallback_rate.is_none());
        assert!(m
            .quality_drop_reasons(&QualityDropThresholds::default())
            .is_empty());
        assert!(m.summary_lines()[1].ends_with("N/A"));
    }
}
