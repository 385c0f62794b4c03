//! Weighted A/B routing across active variants.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::baseline_variant;
use crate::error::StorageResult;
use crate::storage::{Storage, Variant};

/// The instruction text to send and the version label to record against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedVariant {
    pub text: String,
    pub version: String,
}

impl From<Variant> for SelectedVariant {
    fn from(v: Variant) -> Self {
        Self {
            text: v.text,
            version: v.version,
        }
    }
}

/// Cohort key for a set of style tags: the first two, lowercased, sorted and
/// hyphen-joined. `["Classic", "Minimalist"]` becomes `classic-minimalist`.
pub fn cohort_key<S: AsRef<str>>(tags: &[S]) -> Option<String> {
    let mut top: Vec<String> = tags
        .iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .take(2)
        .collect();
    if top.is_empty() {
        return None;
    }
    top.sort();
    Some(top.join("-"))
}

/// Pick from `pool` given `roll` in `[0, Σ traffic_pct)`.
///
/// Returns the first variant whose cumulative weight reaches `roll`, or the
/// first variant when rounding leaves nothing selected.
pub fn pick_weighted(pool: &[Variant], roll: f64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for variant in pool {
        cumulative += variant.traffic_pct as f64;
        if roll <= cumulative {
            return Some(variant);
        }
    }
    pool.first()
}

/// Chooses the variant for each request.
#[derive(Clone)]
pub struct TrafficAllocator {
    storage: Arc<dyn Storage>,
}

impl TrafficAllocator {
    /// Create an allocator.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Select a variant, preferring a cohort override when `cohort` has one.
    ///
    /// Never fails: any persistence error yields the hardcoded baseline.
    pub async fn select_variant(&self, cohort: Option<&str>) -> SelectedVariant {
        match self.try_select(cohort).await {
            Ok(selected) => selected,
            Err(e) => {
                warn!(error = %e, "Variant lookup failed, serving baseline");
                baseline_variant().into()
            }
        }
    }

    async fn try_select(&self, cohort: Option<&str>) -> StorageResult<SelectedVariant> {
        if let Some(key) = cohort {
            let cohort_pool = self.storage.active_variants(Some(key)).await?;
            if let Some(v) = cohort_pool.into_iter().find(|v| v.traffic_pct > 0) {
                debug!(version = %v.version, cohort = %key, "Cohort variant selected");
                return Ok(v.into());
            }
        }

        let pool: Vec<Variant> = self
            .storage
            .active_variants(None)
            .await?
            .into_iter()
            .filter(|v| v.traffic_pct > 0)
            .collect();

        if pool.is_empty() {
            debug!("No active variants, serving baseline");
            return Ok(baseline_variant().into());
        }

        let total: i64 = pool.iter().map(|v| v.traffic_pct).sum();
        let roll = rand::thread_rng().gen_range(0.0..total as f64);

        let selected = pick_weighted(&pool, roll)
            .cloned()
            .unwrap_or_else(baseline_variant);
        debug!(version = %selected.version, roll, total, "Variant selected");
        Ok(selected.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::BASELINE_VERSION;
    use crate::storage::{SqliteStorage, VariantSource};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn variant(version: &str, pct: i64) -> Variant {
        Variant::new(version, format!("text of {}", version), VariantSource::Manual)
            .with_traffic(pct)
    }

    #[test]
    fn test_cohort_key() {
        assert_eq!(
            cohort_key(&["Minimalist", "Classic", "Edgy"]),
            Some("classic-minimalist".to_string())
        );
        assert_eq!(cohort_key(&["  ", "Sporty"]), Some("sporty".to_string()));
        assert_eq!(cohort_key::<&str>(&[]), None);
    }

    #[test]
    fn test_pick_weighted_boundaries() {
        let pool = vec![variant("control", 90), variant("candidate", 10)];
        assert_eq!(pick_weighted(&pool, 0.0).unwrap().version, "control");
        assert_eq!(pick_weighted(&pool, 90.0).unwrap().version, "control");
        assert_eq!(pick_weighted(&pool, 90.5).unwrap().version, "candidate");
        assert_eq!(pick_weighted(&pool, 1000.0).unwrap().version, "control");
        assert!(pick_weighted(&[], 1.0).is_none());
    }

    #[test]
    fn test_allocation_converges_to_weights() {
        let pool = vec![variant("control", 90), variant("candidate", 10)];
        let mut rng = StdRng::seed_from_u64(7);

        let draws = 10_000;
        let candidate_hits = (0..draws)
            .filter(|_| {
                let roll = rng.gen_range(0.0..100.0);
                pick_weighted(&pool, roll).unwrap().version == "candidate"
            })
            .count();

        let share = candidate_hits as f64 / draws as f64;
        assert!((0.08..=0.12).contains(&share), "candidate share {}", share);
    }

    #[tokio::test]
    async fn test_empty_pool_serves_baseline() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let allocator = TrafficAllocator::new(storage);

        let selected = allocator.select_variant(None).await;
        assert_eq!(selected.version, BASELINE_VERSION);
    }

    #[tokio::test]
    async fn test_cohort_override_wins() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        storage.insert_variant(&variant("global", 100)).await.unwrap();
        storage
            .insert_variant(&variant("cohort-v", 100).with_cohort("classic-minimalist"))
            .await
            .unwrap();
        let allocator = TrafficAllocator::new(storage);

        let selected = allocator.select_variant(Some("classic-minimalist")).await;
        assert_eq!(selected.version, "cohort-v");

        // Unknown cohort falls through to the global pool
        let selected = allocator.select_variant(Some("edgy-sporty")).await;
        assert_eq!(selected.version, "global");

        // Cohort variants never leak into the global pool
        for _ in 0..20 {
            assert_eq!(allocator.select_variant(None).await.version, "global");
        }
    }

    #[tokio::test]
    async fn test_zero_traffic_variants_are_skipped() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        storage.insert_variant(&variant("idle", 0)).await.unwrap();
        storage.insert_variant(&variant("busy", 30)).await.unwrap();
        let allocator = TrafficAllocator::new(storage);

        for _ in 0..20 {
            assert_eq!(allocator.select_variant(None).await.version, "busy");
        }
    }

    #[tokio::test]
    async fn test_storage_failure_serves_baseline() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        storage.insert_variant(&variant("global", 100)).await.unwrap();
        storage.close().await;
        let allocator = TrafficAllocator::new(storage);

        let selected = allocator.select_variant(None).await;
        assert_eq!(selected.version, BASELINE_VERSION);
        assert!(selected.text.contains("RESPONSE FORMAT:"));
    }
}
