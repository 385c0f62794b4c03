//! Integration tests for the knowledge miner
//!
//! Mining, diagnosis and calibration run against an in-memory database;
//! the follow-up classifier is served by wiremock.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{body_string_contains, method, path},
    Mock, MockServer, ResponseTemplate,
};

use variant_lab::config::{ProviderConfig, RequestConfig};
use variant_lab::generation::GenerationClient;
use variant_lab::knowledge::KnowledgeMiner;
use variant_lab::provider::ProviderClient;
use variant_lab::storage::{
    ComparisonPost, FollowUpQuestion, OutcomeRecord, SqliteStorage, Storage, StyleProfile,
};

const CLASSIFIER_PATH: &str = "/v1beta/models/classifier:generateContent";

async fn create_test_storage() -> Arc<dyn Storage> {
    Arc::new(
        SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory storage"),
    )
}

fn create_miner(storage: Arc<dyn Storage>, base_url: &str) -> KnowledgeMiner {
    let config = ProviderConfig {
        api_key: "test-api-key".to_string(),
        base_url: base_url.to_string(),
        ..ProviderConfig::default()
    };
    let request = RequestConfig {
        timeout_ms: 5000,
        max_attempts: 1,
        retry_delay_ms: 0,
    };
    let provider = ProviderClient::new(&config, request.clone()).expect("Failed to create client");
    KnowledgeMiner::new(
        storage,
        GenerationClient::new(Arc::new(provider), request),
        "classifier",
    )
}

fn profiled(score: f64, colors: &[&str]) -> OutcomeRecord {
    OutcomeRecord::new("v2.0", Some(score)).with_profile(StyleProfile {
        dominant_colors: colors.iter().map(|c| c.to_string()).collect(),
        ..StyleProfile::default()
    })
}

#[cfg(test)]
mod discovery_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_color_rule_discovered_once() {
        let storage = create_test_storage().await;
        for _ in 0..10 {
            storage
                .insert_outcome(&profiled(8.2, &["navy", "rust"]))
                .await
                .unwrap();
        }
        for _ in 0..20 {
            storage
                .insert_outcome(&profiled(6.4, &["black", "white"]))
                .await
                .unwrap();
        }
        // Unprofiled records do not count
        storage
            .insert_outcome(&OutcomeRecord::new("v2.0", Some(1.0)))
            .await
            .unwrap();

        let miner = create_miner(storage.clone(), "http://127.0.0.1:9");

        let report = miner.discover_rules().await.unwrap();
        assert_eq!(report.scanned, 30);
        assert_eq!(report.rules.len(), 1);
        assert_eq!(report.inserted, 1);

        let rule = &report.rules[0];
        assert_eq!(rule.category, "color");
        assert_eq!(
            rule.rule,
            "The color combination navy + rust consistently scores above average (8.2 vs 7.0 overall avg)"
        );
        assert_eq!(rule.confidence, 0.5);
        assert_eq!(rule.sample_size, 10);
        assert_eq!(rule.evidence, "10 outfits, avg score 8.2");

        let again = miner.discover_rules().await.unwrap();
        assert_eq!(again.rules.len(), 1);
        assert_eq!(again.inserted, 0);
        assert_eq!(storage.list_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_too_few_records_mines_nothing() {
        let storage = create_test_storage().await;
        for _ in 0..19 {
            storage
                .insert_outcome(&profiled(9.0, &["navy", "rust"]))
                .await
                .unwrap();
        }

        let miner = create_miner(storage.clone(), "http://127.0.0.1:9");
        let report = miner.discover_rules().await.unwrap();
        assert!(report.rules.is_empty());
        assert!(storage.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_comparison_rules_are_not_repeated() {
        let storage = create_test_storage().await;
        for _ in 0..6 {
            storage
                .insert_comparison(&ComparisonPost::new(vec!["interview".to_string()], 9, 1))
                .await
                .unwrap();
        }

        let miner = create_miner(storage.clone(), "http://127.0.0.1:9");
        assert_eq!(miner.discover_comparison_rules().await.unwrap(), 1);

        storage
            .insert_comparison(&ComparisonPost::new(vec!["interview".to_string()], 8, 2))
            .await
            .unwrap();
        assert_eq!(miner.discover_comparison_rules().await.unwrap(), 0);

        let rules = storage.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].category, "occasion");
        assert!(rules[0].rule.starts_with("For \"interview\""));
    }
}

#[cfg(test)]
mod follow_up_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_gaps_are_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(CLASSIFIER_PATH))
            .and(body_string_contains("what shoes go with this"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "{\"gaps\": [\"Footwear suggestions missing\", \"  \"]}" }] },
                    "finishReason": "STOP"
                }]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let storage = create_test_storage().await;
        for i in 0..12 {
            storage
                .insert_follow_up(&FollowUpQuestion::new(format!("what shoes go with this? #{}", i)))
                .await
                .unwrap();
        }

        let miner = create_miner(storage, &mock_server.uri());
        let gaps = miner.mine_follow_up_gaps().await.unwrap();
        assert_eq!(gaps, vec!["Footwear suggestions missing"]);
    }

    #[tokio::test]
    async fn test_classifier_failure_yields_no_gaps() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(CLASSIFIER_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let storage = create_test_storage().await;
        for i in 0..10 {
            storage
                .insert_follow_up(&FollowUpQuestion::new(format!("question {}", i)))
                .await
                .unwrap();
        }

        let miner = create_miner(storage, &mock_server.uri());
        assert!(miner.mine_follow_up_gaps().await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod diagnosis_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_low_rated_category_is_diagnosed() {
        let storage = create_test_storage().await;
        for rating in [2, 3, 3, 4] {
            storage
                .insert_outcome(
                    &OutcomeRecord::new("v2.0", Some(7.0))
                        .with_categories(vec!["wedding".to_string()])
                        .with_rating(Some(rating), None),
                )
                .await
                .unwrap();
        }
        for _ in 0..4 {
            storage
                .insert_outcome(
                    &OutcomeRecord::new("v2.0", Some(7.0))
                        .with_categories(vec!["office".to_string()])
                        .with_rating(Some(5), Some(true)),
                )
                .await
                .unwrap();
        }

        let miner = create_miner(storage, "http://127.0.0.1:9");
        let report = miner.diagnose(30).await.unwrap();
        assert_eq!(report.low_performing, vec!["wedding"]);
        assert_eq!(report.weaknesses.len(), 1);
        assert!(report.weaknesses[0].contains("avg rating 3.0/5, n=4"));
        assert!(report.calibration_issues.is_empty());
    }

    #[tokio::test]
    async fn test_calibration_snapshot_is_upserted() {
        let storage = create_test_storage().await;
        for i in 0..12 {
            let score = 6.0 + (i % 4) as f64;
            storage
                .insert_outcome(&OutcomeRecord::new("v2.0", Some(score)).with_community(score - 1.0, 5))
                .await
                .unwrap();
        }
        // Untrusted consensus is not paired
        storage
            .insert_outcome(&OutcomeRecord::new("v2.0", Some(9.0)).with_community(2.0, 2))
            .await
            .unwrap();

        let miner = create_miner(storage.clone(), "http://127.0.0.1:9");
        let snapshot = miner.calibration_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.sample_size, 12);
        assert!((snapshot.delta - 1.0).abs() < 1e-9);
        assert!((snapshot.correlation.unwrap() - 1.0).abs() < 1e-9);

        miner.calibration_snapshot().await.unwrap();
        assert_eq!(storage.recent_snapshots(10).await.unwrap().len(), 1);
    }
}
