//! Online per-variant outcome statistics.
//!
//! Every update is a single SQL statement that folds the new observation
//! into the stored running mean, so concurrent events never overwrite each
//! other. Failures are logged and swallowed: losing one data point must not
//! break the feedback path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::storage::{Storage, MIN_COMMUNITY_VOTES};

/// One observation to fold into a variant's statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub variant_version: String,
    pub score: Option<f64>,
    pub user_rating: Option<f64>,
    pub helpful: Option<bool>,
    /// |generated score - community consensus|; only set when the consensus is trusted.
    pub community_delta: Option<f64>,
}

/// Folds outcome events into per-variant running statistics.
#[derive(Clone)]
pub struct MetricsAggregator {
    storage: Arc<dyn Storage>,
}

impl MetricsAggregator {
    /// Create an aggregator over `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Record a generated score against `version`.
    pub async fn record_outcome(&self, version: &str, score: f64) {
        match self.storage.record_variant_score(version, score).await {
            Ok(true) => debug!(version = %version, score, "Outcome recorded"),
            Ok(false) => debug!(version = %version, "Outcome for unknown variant ignored"),
            Err(e) => warn!(version = %version, error = %e, "Failed to record outcome"),
        }
    }

    /// Record a user rating and/or helpful vote against `version`.
    pub async fn record_rating(&self, version: &str, rating: Option<f64>, helpful: Option<bool>) {
        if rating.is_none() && helpful.is_none() {
            return;
        }
        let rating = rating.filter(|r| (1.0..=5.0).contains(r));

        match self
            .storage
            .record_variant_rating(version, rating, helpful)
            .await
        {
            Ok(true) => debug!(version = %version, ?rating, ?helpful, "Rating recorded"),
            Ok(false) => debug!(version = %version, "Rating for unknown variant ignored"),
            Err(e) => warn!(version = %version, error = %e, "Failed to record rating"),
        }
    }

    /// Record the gap between a generated score and community consensus.
    ///
    /// Ignored unless the consensus has at least three votes behind it.
    pub async fn record_community_delta(
        &self,
        version: &str,
        ai_score: f64,
        consensus_avg: f64,
        consensus_count: i64,
    ) {
        if consensus_count < MIN_COMMUNITY_VOTES {
            return;
        }
        self.record_delta(version, (ai_score - consensus_avg).abs())
            .await;
    }

    async fn record_delta(&self, version: &str, delta: f64) {
        match self.storage.record_variant_delta(version, delta).await {
            Ok(true) => debug!(version = %version, delta, "Community delta recorded"),
            Ok(false) => debug!(version = %version, "Delta for unknown variant ignored"),
            Err(e) => warn!(version = %version, error = %e, "Failed to record community delta"),
        }
    }

    /// Apply a rating and/or helpful vote on an outcome that may already
    /// have been rated.
    ///
    /// A first signal is folded in as a new sample. A repeated one replaces
    /// the outcome's earlier contribution, so each outcome counts once.
    pub async fn revise_rating(
        &self,
        version: &str,
        previous: (Option<f64>, Option<bool>),
        rating: Option<f64>,
        helpful: Option<bool>,
    ) {
        let rating = rating.filter(|r| (1.0..=5.0).contains(r));
        let (previous_rating, previous_helpful) = previous;

        let (new_rating, replaced_rating) = match (previous_rating, rating) {
            (Some(old), Some(new)) => (None, Some((old, new))),
            (None, new) => (new, None),
            (Some(_), None) => (None, None),
        };
        let (new_helpful, replaced_helpful) = match (previous_helpful, helpful) {
            (Some(old), Some(new)) => (None, Some((old, new))),
            (None, new) => (new, None),
            (Some(_), None) => (None, None),
        };

        self.record_rating(version, new_rating, new_helpful).await;

        if let Some((old, new)) = replaced_rating {
            if let Err(e) = self.storage.replace_variant_rating(version, old, new).await {
                warn!(version = %version, error = %e, "Failed to revise rating");
            } else {
                debug!(version = %version, old, new, "Rating revised");
            }
        }
        if let Some((old, new)) = replaced_helpful.filter(|(old, new)| old != new) {
            if let Err(e) = self.storage.replace_variant_helpful(version, old, new).await {
                warn!(version = %version, error = %e, "Failed to revise helpful vote");
            }
        }
    }

    /// Apply updated community consensus for an outcome scored `ai_score`.
    ///
    /// `previous` is the consensus stored before this update. Only trusted
    /// consensus contributes, and each outcome contributes at most once.
    pub async fn revise_community_delta(
        &self,
        version: &str,
        ai_score: f64,
        previous: (Option<f64>, i64),
        consensus_avg: f64,
        consensus_count: i64,
    ) {
        let trusted = |avg: Option<f64>, count: i64| {
            avg.filter(|_| count >= MIN_COMMUNITY_VOTES)
                .map(|avg| (ai_score - avg).abs())
        };
        let old = trusted(previous.0, previous.1);
        let new = trusted(Some(consensus_avg), consensus_count);

        match (old, new) {
            (None, None) => {}
            (None, Some(delta)) => self.record_delta(version, delta).await,
            (Some(old), new) => {
                match self.storage.replace_variant_delta(version, old, new).await {
                    Ok(_) => debug!(version = %version, old, ?new, "Community delta revised"),
                    Err(e) => warn!(version = %version, error = %e, "Failed to revise community delta"),
                }
            }
        }
    }

    /// Fold every populated field of `event`.
    pub async fn record_event(&self, event: &OutcomeEvent) {
        if let Some(score) = event.score {
            self.record_outcome(&event.variant_version, score).await;
        }
        self.record_rating(&event.variant_version, event.user_rating, event.helpful)
            .await;
        if let Some(delta) = event.community_delta {
            self.record_delta(&event.variant_version, delta).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStorage, Variant, VariantSource};

    async fn setup() -> (Arc<SqliteStorage>, MetricsAggregator) {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        storage
            .insert_variant(&Variant::new("v1", "text", VariantSource::Manual))
            .await
            .unwrap();
        let aggregator = MetricsAggregator::new(storage.clone());
        (storage, aggregator)
    }

    #[tokio::test]
    async fn test_running_means() {
        let (storage, metrics) = setup().await;

        for score in [5.0, 7.0, 9.0, 7.0] {
            metrics.record_outcome("v1", score).await;
        }
        metrics.record_rating("v1", Some(4.0), Some(true)).await;
        metrics.record_rating("v1", Some(2.0), Some(false)).await;
        metrics.record_rating("v1", None, Some(true)).await;

        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.sample_size, 4);
        assert!((v.avg_score.unwrap() - 7.0).abs() < 1e-9);
        assert_eq!(v.rating_count, 2);
        assert!((v.avg_user_rating.unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(v.helpful_votes, 3);
        assert_eq!(v.helpful_count, 2);
    }

    #[tokio::test]
    async fn test_untrusted_consensus_is_ignored() {
        let (storage, metrics) = setup().await;

        metrics.record_community_delta("v1", 8.0, 6.0, 2).await;
        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.community_delta_count, 0);
        assert!(v.avg_community_delta.is_none());

        metrics.record_community_delta("v1", 8.0, 6.0, 3).await;
        metrics.record_community_delta("v1", 5.0, 6.0, 12).await;
        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.community_delta_count, 2);
        assert!((v.avg_community_delta.unwrap() - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_version_is_noop() {
        let (storage, metrics) = setup().await;
        metrics.record_outcome("missing", 9.0).await;

        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.sample_size, 0);
        assert!(storage.get_variant("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_is_swallowed() {
        let (storage, metrics) = setup().await;
        storage.close().await;

        // Must not panic or propagate
        metrics.record_outcome("v1", 7.0).await;
        metrics.record_rating("v1", Some(5.0), None).await;
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let (storage, metrics) = setup().await;

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let m = metrics.clone();
                tokio::spawn(async move { m.record_outcome("v1", if i % 2 == 0 { 6.0 } else { 8.0 }).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.sample_size, 20);
        assert!((v.avg_score.unwrap() - 7.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_revised_rating_replaces_contribution() {
        let (storage, metrics) = setup().await;

        metrics.record_rating("v1", Some(4.0), Some(true)).await;
        metrics.revise_rating("v1", (None, None), Some(1.0), Some(true)).await;
        metrics
            .revise_rating("v1", (Some(1.0), Some(true)), Some(5.0), Some(false))
            .await;
        // Rating-only update keeps the stored helpful vote
        metrics
            .revise_rating("v1", (Some(5.0), Some(false)), Some(3.0), None)
            .await;

        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.rating_count, 2);
        assert!((v.avg_user_rating.unwrap() - 3.5).abs() < 1e-9);
        assert_eq!(v.helpful_votes, 2);
        assert_eq!(v.helpful_count, 1);
    }

    #[tokio::test]
    async fn test_revised_consensus_counts_once() {
        let (storage, metrics) = setup().await;

        metrics.revise_community_delta("v1", 8.0, (None, 0), 6.0, 2).await;
        metrics.revise_community_delta("v1", 8.0, (Some(6.0), 2), 6.0, 3).await;
        metrics.revise_community_delta("v1", 8.0, (Some(6.0), 3), 7.0, 4).await;
        metrics.revise_community_delta("v1", 8.0, (Some(7.0), 4), 7.5, 5).await;

        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.community_delta_count, 1);
        assert!((v.avg_community_delta.unwrap() - 0.5).abs() < 1e-9);

        metrics.record_community_delta("v1", 5.0, 6.0, 12).await;
        metrics.revise_community_delta("v1", 8.0, (Some(7.5), 5), 7.5, 1).await;
        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.community_delta_count, 1);
        assert!((v.avg_community_delta.unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_record_event() {
        let (storage, metrics) = setup().await;
        metrics
            .record_event(&OutcomeEvent {
                variant_version: "v1".to_string(),
                score: Some(6.0),
                user_rating: Some(5.0),
                helpful: Some(true),
                community_delta: Some(0.5),
            })
            .await;

        let v = storage.get_variant("v1").await.unwrap().unwrap();
        assert_eq!(v.sample_size, 1);
        assert_eq!(v.rating_count, 1);
        assert_eq!(v.helpful_pct(), Some(100.0));
        assert_eq!(v.avg_community_delta, Some(0.5));
    }
}
