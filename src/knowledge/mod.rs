//! Knowledge mining.
//!
//! Discovers statistically supported rules from historical outcomes and
//! community signals, diagnoses weaknesses of the live variant, and keeps
//! the weekly calibration history.
//!
//! # Passes
//!
//! | Pass | Input | Output |
//! |------|-------|--------|
//! | [`miner`] | Profiled outcome records | Color, archetype and proportion rules |
//! | [`comparison`] | Community comparison votes | Occasion rules |
//! | [`follow_up`] | Follow-up questions | Gap statements (weaknesses) |
//! | [`diagnosis`] | Recent outcomes, snapshots | [`WeaknessReport`] |
//! | [`calibration`] | Scored records with consensus | [`CalibrationSnapshot`] |

pub mod calibration;
pub mod comparison;
pub mod diagnosis;
pub mod follow_up;
pub mod miner;

pub use diagnosis::{diagnose, WeaknessReport};
pub use miner::mine_rules;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StorageResult;
use crate::generation::GenerationClient;
use crate::storage::{CalibrationSnapshot, DiscoveredRule, Storage};

/// Arithmetic mean, `None` for an empty slice.
pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Result of one rule-mining pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiningReport {
    /// Profiled records examined.
    pub scanned: usize,
    /// Every rule that cleared its thresholds.
    pub rules: Vec<DiscoveredRule>,
    /// Rules newly persisted.
    pub inserted: usize,
}

/// Runs the mining passes against storage.
#[derive(Clone)]
pub struct KnowledgeMiner {
    storage: Arc<dyn Storage>,
    client: GenerationClient,
    classifier_model: String,
}

impl KnowledgeMiner {
    /// Create a miner. `classifier_model` serves the follow-up pass.
    pub fn new(
        storage: Arc<dyn Storage>,
        client: GenerationClient,
        classifier_model: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            client,
            classifier_model: classifier_model.into(),
        }
    }

    /// Mine rules from recent profiled outcomes and persist the new ones.
    pub async fn discover_rules(&self) -> StorageResult<MiningReport> {
        let records: Vec<_> = self
            .storage
            .recent_outcomes(miner::MINING_WINDOW)
            .await?
            .into_iter()
            .filter(|r| r.profile.is_some())
            .collect();

        let rules = mine_rules(&records);
        let mut inserted = 0;
        for rule in rules
            .iter()
            .filter(|r| r.confidence >= miner::MIN_PERSIST_CONFIDENCE)
        {
            if self.storage.insert_rule(rule).await? {
                inserted += 1;
            } else {
                debug!(rule = %rule.rule, "Rule already known");
            }
        }

        info!(
            scanned = records.len(),
            found = rules.len(),
            inserted,
            "Rule discovery complete"
        );
        Ok(MiningReport {
            scanned: records.len(),
            rules,
            inserted,
        })
    }

    /// Turn decisive comparison votes into occasion rules. Returns rules created.
    pub async fn discover_comparison_rules(&self) -> StorageResult<usize> {
        let (posts, existing) = tokio::join!(
            self.storage.recent_comparisons(comparison::COMPARISON_WINDOW),
            self.storage.list_rules()
        );
        let (posts, existing) = (posts?, existing?);

        let rules = comparison::comparison_rules(&posts, |occasion| {
            let prefix = comparison::rule_prefix(occasion);
            existing
                .iter()
                .any(|r| r.category == comparison::OCCASION_CATEGORY && r.rule.starts_with(&prefix))
        });

        let mut created = 0;
        for rule in &rules {
            if self.storage.insert_rule(rule).await? {
                created += 1;
            }
        }

        info!(posts = posts.len(), created, "Comparison rules aggregated");
        Ok(created)
    }

    /// Classify recent follow-up questions into gaps.
    pub async fn mine_follow_up_gaps(&self) -> StorageResult<Vec<String>> {
        follow_up::mine_follow_up_gaps(self.storage.as_ref(), &self.client, &self.classifier_model)
            .await
    }

    /// Diagnose weaknesses over the last `window_days`.
    pub async fn diagnose(&self, window_days: i64) -> StorageResult<WeaknessReport> {
        let since = Utc::now() - Duration::days(window_days);
        let (records, snapshots) = tokio::join!(
            self.storage.outcomes_since(since),
            self.storage.recent_snapshots(4)
        );
        Ok(diagnose(&records?, &snapshots?))
    }

    /// Compute and upsert this week's calibration snapshot.
    ///
    /// Returns `None` when there are too few paired records.
    pub async fn calibration_snapshot(&self) -> StorageResult<Option<CalibrationSnapshot>> {
        let records = self
            .storage
            .recent_outcomes(calibration::CALIBRATION_WINDOW)
            .await?;
        let period = calibration::week_period(Utc::now());

        let Some(snapshot) = calibration::build_snapshot(&records, period) else {
            info!("Not enough paired records for a calibration snapshot");
            return Ok(None);
        };

        self.storage.upsert_snapshot(&snapshot).await?;
        info!(
            period = %snapshot.period,
            delta = snapshot.delta,
            correlation = ?snapshot.correlation,
            sample_size = snapshot.sample_size,
            "Calibration snapshot saved"
        );
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequestConfig;
    use crate::provider::{GenerateResponse, MockGenerationProvider, TokenUsage};
    use crate::storage::{ComparisonPost, FollowUpQuestion, SqliteStorage};

    fn client(reply: &'static str) -> GenerationClient {
        let mut mock = MockGenerationProvider::new();
        mock.expect_generate().returning(move |_| {
            Ok(GenerateResponse {
                text: reply.to_string(),
                usage: TokenUsage::default(),
                finish_reason: Some("STOP".to_string()),
            })
        });
        let config = RequestConfig {
            retry_delay_ms: 0,
            ..RequestConfig::default()
        };
        GenerationClient::new(Arc::new(mock), config)
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[2.0, 4.0]), Some(3.0));
    }

    #[tokio::test]
    async fn test_follow_up_gaps_need_enough_questions() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let miner = KnowledgeMiner::new(storage.clone(), client(r#"{"gaps": ["shoes"]}"#), "lite");

        for i in 0..9 {
            storage
                .insert_follow_up(&FollowUpQuestion::new(format!("What shoes go with this? {}", i)))
                .await
                .unwrap();
        }
        assert!(miner.mine_follow_up_gaps().await.unwrap().is_empty());

        storage
            .insert_follow_up(&FollowUpQuestion::new("Would a belt help?"))
            .await
            .unwrap();
        assert_eq!(miner.mine_follow_up_gaps().await.unwrap(), vec!["shoes"]);
    }

    #[tokio::test]
    async fn test_comparison_rules_not_duplicated() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let miner = KnowledgeMiner::new(storage.clone(), client("{}"), "lite");

        for _ in 0..6 {
            storage
                .insert_comparison(&ComparisonPost::new(vec!["interview".to_string()], 9, 1))
                .await
                .unwrap();
        }

        assert_eq!(miner.discover_comparison_rules().await.unwrap(), 1);
        // Another post changes the rule text but not the occasion
        storage
            .insert_comparison(&ComparisonPost::new(vec!["interview".to_string()], 8, 1))
            .await
            .unwrap();
        assert_eq!(miner.discover_comparison_rules().await.unwrap(), 0);
        assert_eq!(storage.list_rules().await.unwrap().len(), 1);
    }
}
