//! Improvement cycle orchestration and the scheduler entry points.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::cohort::{
    cluster_cohorts, compose_cohort_text, summarize_cohort, Cohort, CohortGenerator,
    CohortReport, CohortSkip, COHORT_COOLDOWN_DAYS, COHORT_LEASE, COHORT_SCAN_LIMIT,
    MIN_RATED_CHECKS,
};
use super::{MetaGenerator, PerformanceMetrics};
use crate::config::ImprovementConfig;
use crate::error::AppResult;
use crate::experiment::{DecisionEngine, ExperimentReport};
use crate::knowledge::KnowledgeMiner;
use crate::registry::VariantRegistry;
use crate::storage::{
    CalibrationSnapshot, CycleStatus, CycleTrigger, ImprovementCycle, OutcomeRecord, Storage,
    Variant,
};

/// Lease guarding improvement cycles.
pub const CYCLE_LEASE: &str = "improvement-cycle";

/// Rules fed to the meta-generator per cycle.
const META_RULE_LIMIT: i64 = 10;

/// What a scheduler tick did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TickOutcome {
    /// An experiment is running; it was evaluated instead.
    Evaluated { reports: Vec<ExperimentReport> },
    /// A cycle completed recently.
    CoolingDown { last_cycle: String },
    /// A cycle was started. `cycle` is `None` when another holder had the lease.
    Triggered {
        trigger: CycleTrigger,
        reasons: Vec<String>,
        cycle: Option<ImprovementCycle>,
    },
    /// Nothing to do.
    Idle,
}

/// Sequences measurement, discovery, diagnosis, generation and deployment.
pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    registry: VariantRegistry,
    engine: DecisionEngine,
    miner: KnowledgeMiner,
    meta: MetaGenerator,
    cohort: CohortGenerator,
    config: ImprovementConfig,
    holder: String,
}

enum CohortStep {
    Created(String),
    Skipped(String),
}

impl Orchestrator {
    /// Create an orchestrator with a unique lease holder id.
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: VariantRegistry,
        engine: DecisionEngine,
        miner: KnowledgeMiner,
        meta: MetaGenerator,
        cohort: CohortGenerator,
        config: ImprovementConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            engine,
            miner,
            meta,
            cohort,
            config,
            holder: format!("orchestrator-{}", Uuid::new_v4()),
        }
    }

    /// Run one improvement cycle.
    ///
    /// Returns `None` without writing anything when another process holds the
    /// cycle lease. Otherwise the cycle row is persisted with its full log,
    /// whatever the outcome.
    pub async fn run_improvement_cycle(
        &self,
        trigger: CycleTrigger,
    ) -> AppResult<Option<ImprovementCycle>> {
        let ttl = Duration::seconds(self.config.lease_ttl_secs);
        if !self
            .storage
            .try_acquire_lease(CYCLE_LEASE, &self.holder, ttl)
            .await?
        {
            info!(trigger = %trigger, "Improvement cycle already running elsewhere, skipping");
            return Ok(None);
        }

        let result = self.run_locked(trigger).await;

        if let Err(e) = self.storage.release_lease(CYCLE_LEASE, &self.holder).await {
            warn!(error = %e, "Failed to release cycle lease");
        }

        result.map(Some)
    }

    async fn run_locked(&self, trigger: CycleTrigger) -> AppResult<ImprovementCycle> {
        let mut cycle = ImprovementCycle::new(trigger);
        self.storage.insert_cycle(&cycle).await?;
        info!(cycle_id = %cycle.id, trigger = %trigger, "Improvement cycle started");

        let status = match self.run_steps(&mut cycle).await {
            Ok(status) => status,
            Err(e) => {
                error!(cycle_id = %cycle.id, error = %e, "Improvement cycle failed");
                cycle.log(format!("ERROR: {}", e));
                CycleStatus::Failed
            }
        };
        cycle.finish(status);

        self.storage.update_cycle(&cycle).await?;
        info!(
            cycle_id = %cycle.id,
            status = %cycle.status,
            candidate = ?cycle.candidate_version,
            "Improvement cycle finished"
        );
        Ok(cycle)
    }

    async fn run_steps(&self, cycle: &mut ImprovementCycle) -> AppResult<CycleStatus> {
        // Measure
        cycle.log("--- MEASURE ---");
        let live = self.registry.live_variant().await?;
        let metrics = self.measure(&live.version).await?;
        cycle.source_version = Some(live.version.clone());
        cycle.trigger_metrics = serde_json::to_value(&metrics).ok();
        for line in metrics.summary_lines() {
            cycle.log(line);
        }

        if metrics.sample_size < self.config.min_cycle_sample {
            cycle.log(format!(
                "Not enough data ({} < {} records); stopping.",
                metrics.sample_size, self.config.min_cycle_sample
            ));
            return Ok(CycleStatus::Completed);
        }

        // Discover
        cycle.log("--- DISCOVER ---");
        let mining = self.miner.discover_rules().await?;
        cycle.log(format!(
            "Found {} rules ({} new) in {} profiled records",
            mining.rules.len(),
            mining.inserted,
            mining.scanned
        ));
        for rule in mining.rules.iter().take(5) {
            cycle.log(format!(
                "  [{}] {} (confidence {:.0}%)",
                rule.category,
                rule.rule,
                rule.confidence * 100.0
            ));
        }

        let comparison_rules = match self.miner.discover_comparison_rules().await {
            Ok(n) => {
                cycle.log(format!("Comparison votes: {} new occasion rules", n));
                n
            }
            Err(e) => {
                cycle.log(format!("Comparison pass failed: {}", e));
                0
            }
        };

        let gaps = match self.miner.mine_follow_up_gaps().await {
            Ok(gaps) => gaps,
            Err(e) => {
                cycle.log(format!("Follow-up pass failed: {}", e));
                Vec::new()
            }
        };
        if !gaps.is_empty() {
            cycle.log(format!("Follow-up questions: {} gaps", gaps.len()));
        }

        cycle.knowledge_extracted = Some(json!({
            "rules": mining.rules,
            "rules_inserted": mining.inserted,
            "comparison_rules": comparison_rules,
            "follow_up_gaps": gaps,
        }));

        // Diagnose
        cycle.log("--- DIAGNOSE ---");
        let mut report = self.miner.diagnose(self.config.diagnose_window_days).await?;
        report
            .weaknesses
            .extend(gaps.iter().map(|g| format!("[Follow-up questions] {}", g)));
        cycle.weaknesses_found = report
            .weaknesses
            .iter()
            .chain(report.calibration_issues.iter())
            .cloned()
            .collect();
        cycle.log(format!("Weaknesses: {}", report.weaknesses.len()));
        cycle.log(format!(
            "Low-performing categories: {}",
            if report.low_performing.is_empty() {
                "none".to_string()
            } else {
                report.low_performing.join(", ")
            }
        ));
        cycle.log(format!("Calibration issues: {}", report.calibration_issues.len()));

        let confident_rules = mining
            .rules
            .iter()
            .any(|r| r.confidence >= self.config.rule_confidence_floor);
        let low_rating = metrics
            .avg_user_rating
            .is_some_and(|r| r < self.config.rating_floor);

        if report.is_empty() && !confident_rules && !low_rating {
            cycle.log("No weaknesses or new rules; no candidate needed.");
            return Ok(CycleStatus::Completed);
        }

        if let Some(running) = self
            .registry
            .active_candidates()
            .await?
            .into_iter()
            .find(|c| c.parent_version.as_deref() == Some(live.version.as_str()))
        {
            cycle.log(format!(
                "Experiment {} is still running for {}; not generating another.",
                running.version, live.version
            ));
            return Ok(CycleStatus::Completed);
        }

        // Improve
        cycle.log("--- IMPROVE ---");
        cycle.log(format!("Live variant: {}", live.version));
        let rules = self
            .storage
            .pending_rules(self.config.rule_confidence_floor, META_RULE_LIMIT)
            .await?;

        let candidate = match self
            .meta
            .generate(&live.text, &report, &rules, &metrics)
            .await
        {
            Ok(candidate) => candidate,
            Err(e) => {
                cycle.log(format!("Candidate rejected: {}", e));
                return Ok(CycleStatus::Failed);
            }
        };
        cycle.log(format!(
            "Generated candidate ({} chars vs {} original)",
            candidate.text.chars().count(),
            live.text.chars().count()
        ));

        // Deploy
        cycle.log("--- DEPLOY ---");
        if self.registry.ensure_registered(&live).await? {
            cycle.log(format!("Registered live variant {}", live.version));
        }
        let variant = self
            .registry
            .register_candidate(&live.version, candidate.text, candidate.rule_ids)
            .await?;
        cycle.log(format!(
            "Deployed candidate {} at {}% traffic",
            variant.version, variant.traffic_pct
        ));
        cycle.candidate_version = Some(variant.version);

        Ok(CycleStatus::Completed)
    }

    /// Specialize the live variant for each large style cohort.
    ///
    /// Returns `None` when another process holds the cohort lease. Failures
    /// for one cohort are reported as skips and do not stop the others.
    pub async fn run_cohort_improvement_cycle(&self) -> AppResult<Option<CohortReport>> {
        let ttl = Duration::seconds(self.config.lease_ttl_secs);
        if !self
            .storage
            .try_acquire_lease(COHORT_LEASE, &self.holder, ttl)
            .await?
        {
            info!("Cohort cycle already running elsewhere, skipping");
            return Ok(None);
        }

        let result = self.run_cohorts_locked().await;

        if let Err(e) = self.storage.release_lease(COHORT_LEASE, &self.holder).await {
            warn!(error = %e, "Failed to release cohort lease");
        }

        result.map(Some)
    }

    async fn run_cohorts_locked(&self) -> AppResult<CohortReport> {
        let records = self.storage.recent_outcomes(COHORT_SCAN_LIMIT).await?;
        let cohorts = cluster_cohorts(&records);
        let base = self.registry.live_variant().await?;

        let mut report = CohortReport {
            base_version: base.version.clone(),
            cohorts_found: cohorts.len(),
            ..CohortReport::default()
        };
        if cohorts.is_empty() {
            info!(scanned = records.len(), "No cohort large enough to specialize");
            return Ok(report);
        }
        self.registry.ensure_registered(&base).await?;

        for cohort in &cohorts {
            match self.improve_cohort(cohort, &records, &base).await {
                Ok(CohortStep::Created(version)) => report.created.push(version),
                Ok(CohortStep::Skipped(reason)) => {
                    info!(cohort = %cohort.key, reason = %reason, "Cohort skipped");
                    report.skipped.push(CohortSkip {
                        cohort: cohort.key.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    warn!(cohort = %cohort.key, error = %e, "Cohort specialization failed");
                    report.skipped.push(CohortSkip {
                        cohort: cohort.key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            base = %report.base_version,
            cohorts = report.cohorts_found,
            created = report.created.len(),
            "Cohort cycle finished"
        );
        Ok(report)
    }

    async fn improve_cohort(
        &self,
        cohort: &Cohort,
        records: &[OutcomeRecord],
        base: &Variant,
    ) -> AppResult<CohortStep> {
        let since = Utc::now() - Duration::days(COHORT_COOLDOWN_DAYS);
        if self
            .storage
            .count_cohort_variants_since(&cohort.key, since)
            .await?
            > 0
        {
            return Ok(CohortStep::Skipped(format!(
                "variant created within the last {} days",
                COHORT_COOLDOWN_DAYS
            )));
        }

        let summary = summarize_cohort(cohort, records);
        if summary.checks < MIN_RATED_CHECKS {
            return Ok(CohortStep::Skipped(format!(
                "{} rated outcomes, need {}",
                summary.checks, MIN_RATED_CHECKS
            )));
        }

        let addition = match self.cohort.addition(&summary, &base.text).await {
            Ok(addition) => addition,
            Err(e) => return Ok(CohortStep::Skipped(format!("addition rejected: {}", e))),
        };
        let text = compose_cohort_text(&summary.label, &addition, &base.text);
        let variant = self
            .registry
            .register_cohort_variant(base, &cohort.key, text)
            .await?;
        Ok(CohortStep::Created(variant.version))
    }

    async fn measure(&self, version: &str) -> AppResult<PerformanceMetrics> {
        let records = self
            .storage
            .recent_outcomes(self.config.measure_window)
            .await?;
        Ok(PerformanceMetrics::from_records(version, &records))
    }

    /// Apply the decision engine to every active candidate.
    pub async fn evaluate_active_experiments(&self) -> AppResult<Vec<ExperimentReport>> {
        self.engine.evaluate_active_experiments().await
    }

    /// Scheduler tick: evaluate, trigger a cycle, or do nothing.
    pub async fn check_and_trigger(&self) -> AppResult<TickOutcome> {
        if !self.registry.active_candidates().await?.is_empty() {
            let reports = self.evaluate_active_experiments().await?;
            return Ok(TickOutcome::Evaluated { reports });
        }

        let cooldown = Duration::days(self.config.cooldown_days);
        let now = Utc::now();

        if let Some(last) = self.storage.latest_completed_cycle().await? {
            if last.completed_at.is_some_and(|at| now - at < cooldown) {
                info!(cycle_id = %last.id, "Recent cycle found, skipping");
                return Ok(TickOutcome::CoolingDown { last_cycle: last.id });
            }
        }

        let live = self.registry.live_variant().await?;
        let metrics = self.measure(&live.version).await?;
        let reasons = metrics.quality_drop_reasons(&self.config.quality_drop);

        if !reasons.is_empty() {
            info!(reasons = ?reasons, "Quality drop detected");
            let cycle = self.run_improvement_cycle(CycleTrigger::QualityDrop).await?;
            return Ok(TickOutcome::Triggered {
                trigger: CycleTrigger::QualityDrop,
                reasons,
                cycle,
            });
        }

        let last_started = self
            .storage
            .recent_cycles(1)
            .await?
            .into_iter()
            .next()
            .map(|c| c.started_at);
        if last_started.map_or(true, |at| now - at >= cooldown) {
            info!("Weekly discovery cycle due");
            let cycle = self.run_improvement_cycle(CycleTrigger::Scheduled).await?;
            return Ok(TickOutcome::Triggered {
                trigger: CycleTrigger::Scheduled,
                reasons: Vec::new(),
                cycle,
            });
        }

        Ok(TickOutcome::Idle)
    }

    /// Compute and store this week's calibration snapshot.
    pub async fn run_calibration_snapshot(&self) -> AppResult<Option<CalibrationSnapshot>> {
        Ok(self.miner.calibration_snapshot().await?)
    }
}
