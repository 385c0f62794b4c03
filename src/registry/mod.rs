//! Variant registry.
//!
//! Owns the lifecycle of variants: which one is live, registering
//! experiment candidates derived from it, and the state changes the
//! decision engine applies when an experiment ends.
//!
//! # Lifecycle
//!
//! ```text
//! register_candidate ──► candidate (10%) ──► ramp (+10%, cap 40%)
//!                              │
//!                  ┌───────────┴───────────┐
//!                  ▼                       ▼
//!          promote (100%,            kill (inactive, 0%)
//!          control retired)
//! ```

pub mod allocator;

pub use allocator::{cohort_key, pick_weighted, SelectedVariant, TrafficAllocator};

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ExperimentConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::prompts::{BASELINE_VARIANT, BASELINE_VERSION};
use crate::storage::{Storage, Variant, VariantSource};

/// The hardcoded baseline, served when nothing else is available.
pub fn baseline_variant() -> Variant {
    Variant::new(BASELINE_VERSION, BASELINE_VARIANT, VariantSource::Baseline)
}

/// Variant lifecycle operations over the persistence collaborator.
#[derive(Clone)]
pub struct VariantRegistry {
    storage: Arc<dyn Storage>,
    config: ExperimentConfig,
}

impl VariantRegistry {
    /// Create a registry.
    pub fn new(storage: Arc<dyn Storage>, config: ExperimentConfig) -> Self {
        Self { storage, config }
    }

    /// Fetch a variant by version.
    pub async fn get(&self, version: &str) -> RegistryResult<Option<Variant>> {
        Ok(self.storage.get_variant(version).await?)
    }

    async fn require(&self, version: &str) -> RegistryResult<Variant> {
        self.get(version)
            .await?
            .ok_or_else(|| RegistryError::VariantNotFound {
                version: version.to_string(),
            })
    }

    /// Active variants in a cohort (`None` = global pool), highest traffic first.
    pub async fn list_active(&self, cohort: Option<&str>) -> RegistryResult<Vec<Variant>> {
        Ok(self.storage.active_variants(cohort).await?)
    }

    /// All variants, newest first.
    pub async fn list_all(&self) -> RegistryResult<Vec<Variant>> {
        Ok(self.storage.list_variants().await?)
    }

    /// Active experiment candidates.
    pub async fn active_candidates(&self) -> RegistryResult<Vec<Variant>> {
        Ok(self.storage.active_candidates().await?)
    }

    /// The variant currently serving most global traffic.
    ///
    /// Falls back to the hardcoded baseline when no non-candidate variant is
    /// active in the global pool.
    pub async fn live_variant(&self) -> RegistryResult<Variant> {
        let live = self
            .list_active(None)
            .await?
            .into_iter()
            .find(|v| !v.is_candidate);

        Ok(live.unwrap_or_else(|| baseline_variant().with_traffic(self.config.control_traffic_pct)))
    }

    /// Persist `live` if it is not registered yet, at control traffic.
    ///
    /// Returns true when a row was written.
    pub async fn ensure_registered(&self, live: &Variant) -> RegistryResult<bool> {
        if self.storage.get_variant(&live.version).await?.is_some() {
            return Ok(false);
        }

        let variant = live.clone().with_traffic(self.config.control_traffic_pct);
        self.storage.insert_variant(&variant).await?;
        info!(
            version = %variant.version,
            traffic_pct = variant.traffic_pct,
            "Live variant self-registered"
        );
        Ok(true)
    }

    /// Register a candidate derived from `parent` at candidate traffic.
    ///
    /// # Errors
    /// Returns [`RegistryError::ActiveCandidateExists`] when `parent` already
    /// has an experiment running, and [`RegistryError::VariantNotFound`]
    /// when `parent` is unknown.
    pub async fn register_candidate(
        &self,
        parent: &str,
        text: impl Into<String>,
        rule_ids: Vec<String>,
    ) -> RegistryResult<Variant> {
        let parent_variant = self.require(parent).await?;

        if let Some(existing) = self
            .active_candidates()
            .await?
            .into_iter()
            .find(|c| c.parent_version.as_deref() == Some(parent))
        {
            return Err(RegistryError::ActiveCandidateExists {
                parent: parent.to_string(),
                candidate: existing.version,
            });
        }

        let version = self.next_child_version(parent).await?;
        let mut candidate = Variant::new(version, text, VariantSource::AutoOptimize)
            .with_parent(parent)
            .with_traffic(self.config.candidate_traffic_pct)
            .with_rule_ids(rule_ids)
            .as_candidate();
        candidate.cohort = parent_variant.cohort;

        self.storage.insert_variant(&candidate).await?;
        info!(
            version = %candidate.version,
            parent = %parent,
            traffic_pct = candidate.traffic_pct,
            rules = candidate.source_rule_ids.len(),
            "Candidate registered"
        );
        Ok(candidate)
    }

    /// Register a cohort override derived from `base` at full cohort traffic.
    ///
    /// Older overrides for the same cohort are retired so routing stays
    /// deterministic.
    pub async fn register_cohort_variant(
        &self,
        base: &Variant,
        cohort: &str,
        text: impl Into<String>,
    ) -> RegistryResult<Variant> {
        let version = format!(
            "{}-cohort-{}-{}",
            base.version,
            cohort,
            Utc::now().timestamp_millis()
        );
        let variant = Variant::new(version, text, VariantSource::Cohort)
            .with_parent(&base.version)
            .with_cohort(cohort)
            .with_traffic(100);

        self.storage.insert_variant(&variant).await?;
        let retired = self
            .storage
            .retire_cohort_variants(cohort, &variant.version)
            .await?;
        info!(
            version = %variant.version,
            cohort = %cohort,
            parent = %base.version,
            retired,
            "Cohort variant registered"
        );
        Ok(variant)
    }

    async fn next_child_version(&self, parent: &str) -> RegistryResult<String> {
        let mut n = self.storage.count_children(parent).await?;
        loop {
            let version = if n == 0 {
                format!("{}-auto", parent)
            } else {
                format!("{}-auto-{}", parent, n + 1)
            };
            if self.storage.get_variant(&version).await?.is_none() {
                return Ok(version);
            }
            debug!(version = %version, "Version taken, trying next");
            n += 1;
        }
    }

    /// Make `candidate` the live variant and retire `control`.
    pub async fn promote(&self, candidate: &str, control: &str) -> RegistryResult<()> {
        self.require(candidate).await?;
        self.require(control).await?;

        self.storage
            .promote_variant(candidate, Some(control), Utc::now())
            .await?;

        info!(candidate = %candidate, control = %control, "Candidate promoted");
        Ok(())
    }

    /// End an experiment without promotion.
    pub async fn kill(&self, candidate: &str) -> RegistryResult<()> {
        self.require(candidate).await?;
        self.storage
            .set_variant_state(candidate, false, false, 0, None)
            .await?;

        info!(candidate = %candidate, "Candidate killed");
        Ok(())
    }

    /// Change only the routing weight.
    pub async fn set_traffic(&self, version: &str, traffic_pct: i64) -> RegistryResult<()> {
        self.require(version).await?;
        self.storage
            .set_traffic(version, traffic_pct.clamp(0, 100))
            .await?;

        debug!(version = %version, traffic_pct, "Traffic updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    async fn setup() -> (Arc<SqliteStorage>, VariantRegistry) {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let registry = VariantRegistry::new(storage.clone(), ExperimentConfig::default());
        (storage, registry)
    }

    #[tokio::test]
    async fn test_live_variant_defaults_to_baseline() {
        let (_, registry) = setup().await;
        let live = registry.live_variant().await.unwrap();
        assert_eq!(live.version, BASELINE_VERSION);
        assert_eq!(live.source, VariantSource::Baseline);
        assert_eq!(live.traffic_pct, 90);
    }

    #[tokio::test]
    async fn test_ensure_registered_is_idempotent() {
        let (storage, registry) = setup().await;
        let live = registry.live_variant().await.unwrap();

        assert!(registry.ensure_registered(&live).await.unwrap());
        assert!(!registry.ensure_registered(&live).await.unwrap());
        assert_eq!(storage.list_variants().await.unwrap().len(), 1);

        let stored = registry.live_variant().await.unwrap();
        assert_eq!(stored.version, BASELINE_VERSION);
        assert_eq!(stored.traffic_pct, 90);
    }

    #[tokio::test]
    async fn test_cohort_variant_replaces_older_override() {
        let (storage, registry) = setup().await;
        let live = registry.live_variant().await.unwrap();
        registry.ensure_registered(&live).await.unwrap();

        let first = registry
            .register_cohort_variant(&live, "classic-minimalist", "first")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = registry
            .register_cohort_variant(&live, "classic-minimalist", "second")
            .await
            .unwrap();

        assert!(second.version.starts_with("v2.0-cohort-classic-minimalist-"));
        assert_eq!(second.parent_version.as_deref(), Some("v2.0"));
        assert_eq!(second.source, VariantSource::Cohort);
        assert_eq!(second.traffic_pct, 100);
        assert!(second.is_active && !second.is_candidate);

        let pool = storage.active_variants(Some("classic-minimalist")).await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].version, second.version);
        let retired = storage.get_variant(&first.version).await.unwrap().unwrap();
        assert!(!retired.is_active);

        // The global pool is untouched
        assert_eq!(registry.live_variant().await.unwrap().version, "v2.0");
    }

    #[tokio::test]
    async fn test_register_candidate_versions() {
        let (_, registry) = setup().await;
        let live = registry.live_variant().await.unwrap();
        registry.ensure_registered(&live).await.unwrap();

        let first = registry
            .register_candidate("v2.0", "better text", vec!["r1".to_string()])
            .await
            .unwrap();
        assert_eq!(first.version, "v2.0-auto");
        assert_eq!(first.traffic_pct, 10);
        assert!(first.is_candidate);
        assert_eq!(first.source_rule_ids, vec!["r1"]);

        registry.kill(&first.version).await.unwrap();

        let second = registry
            .register_candidate("v2.0", "even better", Vec::new())
            .await
            .unwrap();
        assert_eq!(second.version, "v2.0-auto-2");
    }

    #[tokio::test]
    async fn test_one_active_candidate_per_parent() {
        let (_, registry) = setup().await;
        let live = registry.live_variant().await.unwrap();
        registry.ensure_registered(&live).await.unwrap();

        registry
            .register_candidate("v2.0", "a", Vec::new())
            .await
            .unwrap();
        let err = registry
            .register_candidate("v2.0", "b", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ActiveCandidateExists { ref candidate, .. } if candidate == "v2.0-auto"
        ));
    }

    #[tokio::test]
    async fn test_unknown_parent_rejected() {
        let (_, registry) = setup().await;
        let err = registry
            .register_candidate("nope", "a", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::VariantNotFound { .. }));
    }

    #[tokio::test]
    async fn test_promote_retires_control() {
        let (_, registry) = setup().await;
        let live = registry.live_variant().await.unwrap();
        registry.ensure_registered(&live).await.unwrap();
        let candidate = registry
            .register_candidate("v2.0", "new", Vec::new())
            .await
            .unwrap();

        registry.promote(&candidate.version, "v2.0").await.unwrap();

        let control = registry.get("v2.0").await.unwrap().unwrap();
        assert!(!control.is_active);
        assert_eq!(control.traffic_pct, 0);

        let promoted = registry.get(&candidate.version).await.unwrap().unwrap();
        assert!(promoted.is_active);
        assert!(!promoted.is_candidate);
        assert_eq!(promoted.traffic_pct, 100);
        assert!(promoted.promoted_at.is_some());

        assert_eq!(
            registry.live_variant().await.unwrap().version,
            candidate.version
        );
    }

    #[tokio::test]
    async fn test_set_traffic_clamps() {
        let (storage, registry) = setup().await;
        storage
            .insert_variant(&Variant::new("m1", "t", VariantSource::Manual))
            .await
            .unwrap();

        registry.set_traffic("m1", 250).await.unwrap();
        assert_eq!(registry.get("m1").await.unwrap().unwrap().traffic_pct, 100);
        assert!(registry.set_traffic("missing", 5).await.is_err());
    }
}
