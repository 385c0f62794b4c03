//! End-to-end experiment tests
//!
//! Drives the registry, metrics aggregator and decision engine against an
//! in-memory database the way the serving path and scheduler do.

use pretty_assertions::assert_eq;
use std::sync::Arc;

use variant_lab::config::{ExperimentConfig, RuleAttribution};
use variant_lab::experiment::{Decision, DecisionEngine};
use variant_lab::metrics::MetricsAggregator;
use variant_lab::registry::{VariantRegistry, TrafficAllocator};
use variant_lab::storage::{DiscoveredRule, SqliteStorage, Storage, Variant, VariantSource};

struct Harness {
    storage: Arc<dyn Storage>,
    registry: VariantRegistry,
    metrics: MetricsAggregator,
    engine: DecisionEngine,
}

async fn create_harness(config: ExperimentConfig) -> Harness {
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory storage"),
    );
    let registry = VariantRegistry::new(storage.clone(), config.clone());
    let metrics = MetricsAggregator::new(storage.clone());
    let engine = DecisionEngine::new(registry.clone(), storage.clone(), config);

    storage
        .insert_variant(&Variant::new("v2.0", "live text", VariantSource::Baseline).with_traffic(90))
        .await
        .unwrap();

    Harness {
        storage,
        registry,
        metrics,
        engine,
    }
}

/// Record `n` scored and rated outcomes whose ratings average `avg_rating`.
async fn feed(metrics: &MetricsAggregator, version: &str, n: usize, avg_rating: f64) {
    for i in 0..n {
        metrics.record_outcome(version, 7.0).await;
        // Alternate around the mean so the average lands exactly on it
        let offset = if i % 2 == 0 { 0.5 } else { -0.5 };
        let rating = if n % 2 == 1 && i == n - 1 {
            avg_rating
        } else {
            avg_rating + offset
        };
        metrics.record_rating(version, Some(rating), Some(rating >= 4.0)).await;
    }
}

#[cfg(test)]
mod decision_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_promote_retires_control_and_marks_used_rules() {
        let h = create_harness(ExperimentConfig::default()).await;

        let used = DiscoveredRule::new("color", "navy + rust", 0.6, 12, "12 outfits");
        let unused = DiscoveredRule::new("color", "olive + cream", 0.7, 14, "14 outfits");
        h.storage.insert_rule(&used).await.unwrap();
        h.storage.insert_rule(&unused).await.unwrap();

        let candidate = h
            .registry
            .register_candidate("v2.0", "better text", vec![used.id.clone()])
            .await
            .unwrap();
        assert_eq!(candidate.version, "v2.0-auto");
        assert_eq!(candidate.traffic_pct, 10);

        feed(&h.metrics, "v2.0", 50, 4.0).await;
        feed(&h.metrics, "v2.0-auto", 50, 4.5).await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].decision, Decision::Promote);
        assert_eq!(reports[0].rules_incorporated, 1);
        let cmp = reports[0].comparison.unwrap();
        assert!((cmp.rating_improvement - 0.5).abs() < 1e-9);

        let promoted = h.registry.get("v2.0-auto").await.unwrap().unwrap();
        assert!(promoted.is_active);
        assert!(!promoted.is_candidate);
        assert_eq!(promoted.traffic_pct, 100);
        assert!(promoted.promoted_at.is_some());

        let control = h.registry.get("v2.0").await.unwrap().unwrap();
        assert!(!control.is_active);
        assert_eq!(control.traffic_pct, 0);

        assert_eq!(h.registry.live_variant().await.unwrap().version, "v2.0-auto");

        let pending = h.storage.pending_rules(0.0, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, unused.id);

        // The promoted variant can parent the next experiment
        let next = h
            .registry
            .register_candidate("v2.0-auto", "even better", vec![])
            .await
            .unwrap();
        assert_eq!(next.version, "v2.0-auto-auto");
    }

    #[tokio::test]
    async fn test_promote_can_attribute_all_pending_rules() {
        let config = ExperimentConfig {
            rule_attribution: RuleAttribution::AllUnincorporated,
            ..ExperimentConfig::default()
        };
        let h = create_harness(config).await;

        for text in ["a", "b", "c"] {
            h.storage
                .insert_rule(&DiscoveredRule::new("color", text, 0.6, 10, ""))
                .await
                .unwrap();
        }
        h.registry
            .register_candidate("v2.0", "better", vec![])
            .await
            .unwrap();

        feed(&h.metrics, "v2.0", 50, 4.0).await;
        feed(&h.metrics, "v2.0-auto", 50, 4.5).await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        assert_eq!(reports[0].rules_incorporated, 3);
        assert!(h.storage.pending_rules(0.0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kill_leaves_control_untouched() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "worse", vec![])
            .await
            .unwrap();

        feed(&h.metrics, "v2.0", 50, 4.0).await;
        feed(&h.metrics, "v2.0-auto", 50, 3.5).await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        assert_eq!(reports[0].decision, Decision::Kill);

        let killed = h.registry.get("v2.0-auto").await.unwrap().unwrap();
        assert!(!killed.is_active);
        assert_eq!(killed.traffic_pct, 0);

        let control = h.registry.get("v2.0").await.unwrap().unwrap();
        assert!(control.is_active);
        assert_eq!(control.traffic_pct, 90);
        assert!(h.registry.active_candidates().await.unwrap().is_empty());

        // A killed experiment frees the parent for a new one
        let retry = h
            .registry
            .register_candidate("v2.0", "another try", vec![])
            .await
            .unwrap();
        assert_eq!(retry.version, "v2.0-auto-2");
    }

    #[tokio::test]
    async fn test_inconclusive_ramps_until_cap() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "similar", vec![])
            .await
            .unwrap();

        feed(&h.metrics, "v2.0", 50, 4.0).await;
        feed(&h.metrics, "v2.0-auto", 50, 4.0).await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            let reports = h.engine.evaluate_active_experiments().await.unwrap();
            match &reports[0].decision {
                Decision::Ramp { new_pct } => seen.push(*new_pct),
                other => panic!("unexpected decision {:?}", other),
            }
        }
        assert_eq!(seen, vec![20, 30, 40, 40]);

        let candidate = h.registry.get("v2.0-auto").await.unwrap().unwrap();
        assert!(candidate.is_candidate);
        assert_eq!(candidate.traffic_pct, 40);
    }

    #[tokio::test]
    async fn test_insufficient_data_changes_nothing() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "new", vec![])
            .await
            .unwrap();

        feed(&h.metrics, "v2.0", 50, 4.0).await;
        feed(&h.metrics, "v2.0-auto", 49, 4.0).await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        assert_eq!(
            reports[0].decision,
            Decision::Insufficient {
                candidate_samples: 49,
                control_samples: 50
            }
        );
        assert!(reports[0].comparison.is_none());

        let candidate = h.registry.get("v2.0-auto").await.unwrap().unwrap();
        assert!(candidate.is_candidate);
        assert_eq!(candidate.traffic_pct, 10);
    }

    #[tokio::test]
    async fn test_missing_control_is_reported() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.storage
            .insert_variant(
                &Variant::new("orphan", "t", VariantSource::Manual)
                    .with_parent("gone")
                    .with_traffic(10)
                    .as_candidate(),
            )
            .await
            .unwrap();

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        assert_eq!(reports[0].decision, Decision::NoControl);
        assert_eq!(reports[0].control.as_deref(), Some("gone"));
    }
}

#[cfg(test)]
mod scenario_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Record `n` scored outcomes with no rating or community signal.
    async fn feed_scores_only(metrics: &MetricsAggregator, version: &str, n: usize) {
        for _ in 0..n {
            metrics.record_outcome(version, 7.0).await;
        }
    }

    #[tokio::test]
    async fn test_small_rating_lift_promotes() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "better", vec![])
            .await
            .unwrap();

        feed(&h.metrics, "v2.0", 60, 4.0).await;
        feed(&h.metrics, "v2.0-auto", 55, 4.15).await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        assert_eq!(reports[0].decision, Decision::Promote);
        let cmp = reports[0].comparison.unwrap();
        assert!((cmp.rating_improvement - 0.15).abs() < 1e-6);

        let control = h.registry.get("v2.0").await.unwrap().unwrap();
        assert!(!control.is_active);
        assert_eq!(control.traffic_pct, 0);
        let promoted = h.registry.get("v2.0-auto").await.unwrap().unwrap();
        assert!(promoted.is_active);
        assert_eq!(promoted.traffic_pct, 100);
    }

    #[tokio::test]
    async fn test_rating_drop_kills() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "worse", vec![])
            .await
            .unwrap();

        feed(&h.metrics, "v2.0", 60, 3.9).await;
        feed(&h.metrics, "v2.0-auto", 55, 3.5).await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        assert_eq!(reports[0].decision, Decision::Kill);
        let cmp = reports[0].comparison.unwrap();
        assert!((cmp.rating_improvement + 0.4).abs() < 1e-6);

        let killed = h.registry.get("v2.0-auto").await.unwrap().unwrap();
        assert!(!killed.is_active);
        assert_eq!(killed.traffic_pct, 0);
    }

    #[tokio::test]
    async fn test_unrated_candidate_counts_as_zero() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "unrated", vec![])
            .await
            .unwrap();

        feed(&h.metrics, "v2.0", 50, 4.0).await;
        feed_scores_only(&h.metrics, "v2.0-auto", 50).await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        let cmp = reports[0].comparison.unwrap();
        assert_eq!(cmp.candidate_rating, 0.0);
        assert_eq!(cmp.candidate_delta, 10.0);
        assert_eq!(reports[0].decision, Decision::Kill);
    }

    #[tokio::test]
    async fn test_no_signals_on_either_side_ramps() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "unrated", vec![])
            .await
            .unwrap();

        feed_scores_only(&h.metrics, "v2.0", 50).await;
        feed_scores_only(&h.metrics, "v2.0-auto", 50).await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        let cmp = reports[0].comparison.unwrap();
        assert_eq!(cmp.rating_improvement, 0.0);
        assert_eq!(cmp.delta_improvement, 0.0);
        assert_eq!(reports[0].decision, Decision::Ramp { new_pct: 20 });
    }

    #[tokio::test]
    async fn test_community_agreement_promotes_at_equal_rating() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "calibrated", vec![])
            .await
            .unwrap();

        feed(&h.metrics, "v2.0", 50, 4.0).await;
        feed(&h.metrics, "v2.0-auto", 50, 4.0).await;
        // Only the candidate has trusted consensus; the control's delta defaults to 10
        h.metrics
            .record_community_delta("v2.0-auto", 7.0, 6.0, 5)
            .await;

        let reports = h.engine.evaluate_active_experiments().await.unwrap();
        let cmp = reports[0].comparison.unwrap();
        assert_eq!(cmp.control_delta, 10.0);
        assert!((cmp.delta_improvement - 9.0).abs() < 1e-9);
        assert_eq!(reports[0].decision, Decision::Promote);
    }
}

#[cfg(test)]
mod allocation_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_candidate_traffic_follows_ramp() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "candidate", vec![])
            .await
            .unwrap();
        h.registry.set_traffic("v2.0-auto", 40).await.unwrap();

        let allocator = TrafficAllocator::new(h.storage.clone());
        let mut candidate_hits = 0;
        for _ in 0..2000 {
            if allocator.select_variant(None).await.version == "v2.0-auto" {
                candidate_hits += 1;
            }
        }

        // 40 / (90 + 40) of traffic
        let share = candidate_hits as f64 / 2000.0;
        assert!((0.24..0.38).contains(&share), "share was {}", share);
    }

    #[tokio::test]
    async fn test_promoted_variant_takes_all_traffic() {
        let h = create_harness(ExperimentConfig::default()).await;
        h.registry
            .register_candidate("v2.0", "candidate", vec![])
            .await
            .unwrap();
        h.registry.promote("v2.0-auto", "v2.0").await.unwrap();

        let allocator = TrafficAllocator::new(h.storage.clone());
        for _ in 0..50 {
            assert_eq!(allocator.select_variant(None).await.version, "v2.0-auto");
        }
    }
}
