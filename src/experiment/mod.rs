//! Experiment decision engine.
//!
//! Compares each active candidate against its parent (the control) and
//! promotes, kills or ramps it. [`decide`] is pure; [`DecisionEngine`]
//! applies its verdicts through the registry.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ExperimentConfig, RuleAttribution};
use crate::error::AppResult;
use crate::registry::VariantRegistry;
use crate::storage::{Storage, Variant};

/// Rating assumed for a variant nobody has rated.
const MISSING_RATING: f64 = 0.0;
/// Community delta assumed for a variant with no trusted consensus.
const MISSING_DELTA: f64 = 10.0;

/// Candidate-versus-control metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub candidate_rating: f64,
    pub control_rating: f64,
    pub candidate_delta: f64,
    pub control_delta: f64,
    /// Positive when the candidate is rated higher.
    pub rating_improvement: f64,
    /// Positive when the candidate agrees more closely with the community.
    pub delta_improvement: f64,
}

impl Comparison {
    /// Compare two variants, substituting defaults for missing statistics.
    pub fn between(candidate: &Variant, control: &Variant) -> Self {
        let candidate_rating = candidate.avg_user_rating.unwrap_or(MISSING_RATING);
        let control_rating = control.avg_user_rating.unwrap_or(MISSING_RATING);
        let candidate_delta = candidate.avg_community_delta.unwrap_or(MISSING_DELTA);
        let control_delta = control.avg_community_delta.unwrap_or(MISSING_DELTA);

        Self {
            candidate_rating,
            control_rating,
            candidate_delta,
            control_delta,
            rating_improvement: candidate_rating - control_rating,
            delta_improvement: control_delta - candidate_delta,
        }
    }
}

/// Verdict for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Not enough data on one side; nothing changes.
    Insufficient {
        candidate_samples: i64,
        control_samples: i64,
    },
    /// Candidate has no usable control.
    NoControl,
    /// Candidate wins.
    Promote,
    /// Candidate clearly underperforms.
    Kill,
    /// Inconclusive; widen the candidate's share.
    Ramp { new_pct: i64 },
}

/// Decide the fate of `candidate` against `control`.
pub fn decide(candidate: &Variant, control: &Variant, config: &ExperimentConfig) -> Decision {
    if candidate.sample_size < config.min_sample_size || control.sample_size < config.min_sample_size
    {
        return Decision::Insufficient {
            candidate_samples: candidate.sample_size,
            control_samples: control.sample_size,
        };
    }

    let cmp = Comparison::between(candidate, control);

    if cmp.rating_improvement > config.promote_rating_margin
        || (cmp.rating_improvement >= 0.0 && cmp.delta_improvement > config.promote_delta_margin)
    {
        Decision::Promote
    } else if cmp.rating_improvement < config.kill_rating_margin {
        Decision::Kill
    } else {
        Decision::Ramp {
            new_pct: (candidate.traffic_pct + config.ramp_step_pct).min(config.ramp_cap_pct),
        }
    }
}

/// Outcome of evaluating one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub candidate: String,
    pub control: Option<String>,
    #[serde(flatten)]
    pub decision: Decision,
    pub comparison: Option<Comparison>,
    /// Rules marked incorporated on promotion.
    pub rules_incorporated: u64,
}

/// Applies [`decide`] to live experiments.
#[derive(Clone)]
pub struct DecisionEngine {
    registry: VariantRegistry,
    storage: Arc<dyn Storage>,
    config: ExperimentConfig,
}

impl DecisionEngine {
    /// Create a decision engine.
    pub fn new(registry: VariantRegistry, storage: Arc<dyn Storage>, config: ExperimentConfig) -> Self {
        Self {
            registry,
            storage,
            config,
        }
    }

    /// Evaluate every active candidate.
    ///
    /// A failure on one candidate is logged and does not stop the others.
    pub async fn evaluate_active_experiments(&self) -> AppResult<Vec<ExperimentReport>> {
        let candidates = self.registry.active_candidates().await?;
        let mut reports = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            match self.evaluate(&candidate).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(
                    candidate = %candidate.version,
                    error = %e,
                    "Experiment evaluation failed"
                ),
            }
        }

        Ok(reports)
    }

    /// Evaluate and apply the verdict for one candidate.
    pub async fn evaluate(&self, candidate: &Variant) -> AppResult<ExperimentReport> {
        let control = match &candidate.parent_version {
            Some(parent) => self.registry.get(parent).await?,
            None => None,
        };

        let Some(control) = control else {
            warn!(candidate = %candidate.version, "Candidate has no control variant");
            return Ok(ExperimentReport {
                candidate: candidate.version.clone(),
                control: candidate.parent_version.clone(),
                decision: Decision::NoControl,
                comparison: None,
                rules_incorporated: 0,
            });
        };

        let decision = decide(candidate, &control, &self.config);
        let comparison = match decision {
            Decision::Insufficient { .. } => None,
            _ => Some(Comparison::between(candidate, &control)),
        };

        if let Some(cmp) = &comparison {
            info!(
                candidate = %candidate.version,
                control = %control.version,
                candidate_rating = cmp.candidate_rating,
                control_rating = cmp.control_rating,
                rating_improvement = cmp.rating_improvement,
                delta_improvement = cmp.delta_improvement,
                "Experiment compared"
            );
        }

        let rules_incorporated = self.apply(candidate, &control, &decision).await?;

        Ok(ExperimentReport {
            candidate: candidate.version.clone(),
            control: Some(control.version.clone()),
            decision,
            comparison,
            rules_incorporated,
        })
    }

    /// Apply a verdict. Returns the number of rules marked incorporated.
    pub async fn apply(
        &self,
        candidate: &Variant,
        control: &Variant,
        decision: &Decision,
    ) -> AppResult<u64> {
        match decision {
            Decision::Insufficient {
                candidate_samples,
                control_samples,
            } => {
                info!(
                    candidate = %candidate.version,
                    candidate_samples,
                    control_samples,
                    "Waiting for more data"
                );
                Ok(0)
            }
            Decision::NoControl => Ok(0),
            Decision::Promote => {
                self.registry
                    .promote(&candidate.version, &control.version)
                    .await?;
                let marked = match self.config.rule_attribution {
                    RuleAttribution::UsedRules => {
                        self.storage
                            .mark_rules_incorporated(&candidate.source_rule_ids, &candidate.version)
                            .await?
                    }
                    RuleAttribution::AllUnincorporated => {
                        self.storage
                            .mark_all_rules_incorporated(&candidate.version)
                            .await?
                    }
                };
                info!(
                    candidate = %candidate.version,
                    rules_incorporated = marked,
                    "Promotion complete"
                );
                Ok(marked)
            }
            Decision::Kill => {
                self.registry.kill(&candidate.version).await?;
                Ok(0)
            }
            Decision::Ramp { new_pct } => {
                self.registry
                    .set_traffic(&candidate.version, *new_pct)
                    .await?;
                info!(candidate = %candidate.version, traffic_pct = new_pct, "Candidate ramped");
                Ok(0)
            }
        }
    }
}
