//! The feedback-serving path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::generation::{FeedbackResult, GenerationClient, Provenance};
use crate::metrics::MetricsAggregator;
use crate::prompts::{build_feedback_prompt, FeedbackContext};
use crate::provider::{Attachment, GenerateRequest};
use crate::registry::{cohort_key, SelectedVariant, TrafficAllocator};
use crate::storage::{ComparisonPost, FollowUpQuestion, OutcomeRecord, Storage};

/// One analysis request.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    /// Photo to analyze.
    pub attachment: Option<Attachment>,
    /// What the user told us about the outfit.
    pub context: FeedbackContext,
    /// The user's style archetypes, most prominent first; drives cohort routing.
    pub style_tags: Vec<String>,
    /// Priority processing: cooler sampling and a larger output budget.
    pub priority: bool,
    /// Requesting user, recorded for cohort clustering.
    pub user_id: Option<String>,
}

const STANDARD_MAX_TOKENS: u32 = 4096;
const PRIORITY_MAX_TOKENS: u32 = 8192;

/// A served analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Id of the stored outcome record, used for later ratings.
    pub outcome_id: String,
    /// Variant that produced the result.
    pub version: String,
    pub feedback: FeedbackResult,
    pub is_fallback: bool,
    pub is_repaired: bool,
    pub provenance: Provenance,
}

/// Select, generate, record.
#[derive(Clone)]
pub struct FeedbackService {
    storage: Arc<dyn Storage>,
    allocator: TrafficAllocator,
    client: GenerationClient,
    metrics: MetricsAggregator,
    model: String,
}

impl FeedbackService {
    /// Create a feedback service generating with `model`.
    pub fn new(
        storage: Arc<dyn Storage>,
        allocator: TrafficAllocator,
        client: GenerationClient,
        metrics: MetricsAggregator,
        model: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            allocator,
            client,
            metrics,
            model: model.into(),
        }
    }

    /// Choose the variant for a request.
    pub async fn select_variant(&self, cohort: Option<&str>) -> SelectedVariant {
        self.allocator.select_variant(cohort).await
    }

    /// Record a generated score against a variant.
    pub async fn record_outcome(&self, version: &str, score: f64) {
        self.metrics.record_outcome(version, score).await;
    }

    /// Record a rating against a variant.
    pub async fn record_rating(&self, version: &str, rating: Option<f64>, helpful: Option<bool>) {
        self.metrics.record_rating(version, rating, helpful).await;
    }

    /// Run the whole path for one request.
    ///
    /// Never fails: generation falls back and persistence failures are
    /// logged. The returned `outcome_id` is only rateable when the record
    /// was stored.
    pub async fn analyze(&self, request: AnalysisRequest) -> Analysis {
        let cohort = cohort_key(&request.style_tags);
        let variant = self.select_variant(cohort.as_deref()).await;

        let (temperature, max_tokens) = if request.priority {
            (0.3, PRIORITY_MAX_TOKENS)
        } else {
            (0.5, STANDARD_MAX_TOKENS)
        };
        let mut generate = GenerateRequest::new(&self.model, build_feedback_prompt(&request.context))
            .with_system_instruction(&variant.text)
            .with_temperature(temperature)
            .with_max_tokens(max_tokens)
            .with_schema(FeedbackResult::response_schema());
        if let Some(attachment) = request.attachment {
            generate = generate.with_attachment(attachment);
        }

        let outcome = self.client.generate::<FeedbackResult>(&generate).await;
        let is_fallback = outcome.is_fallback();
        let is_repaired = outcome.is_repaired();
        let provenance = outcome.provenance();
        let feedback = outcome.into_value();

        let mut record = OutcomeRecord::new(&variant.version, Some(feedback.overall_score))
            .with_categories(request.context.occasions.clone());
        if let Some(profile) = feedback.style_profile() {
            record = record.with_profile(profile);
        }
        if let Some(user) = &request.user_id {
            record = record.with_user(user.clone());
        }
        if is_fallback {
            record = record.as_fallback();
        }

        if let Err(e) = self.storage.insert_outcome(&record).await {
            warn!(version = %variant.version, error = %e, "Failed to store outcome record");
        }
        // Fallback scores say nothing about the variant
        if !is_fallback {
            self.record_outcome(&variant.version, feedback.overall_score)
                .await;
        }

        info!(
            version = %variant.version,
            cohort = ?cohort,
            score = feedback.overall_score,
            fallback = is_fallback,
            attempts = provenance.attempts,
            latency_ms = provenance.latency_ms,
            "Analysis served"
        );

        Analysis {
            outcome_id: record.id,
            version: variant.version,
            feedback,
            is_fallback,
            is_repaired,
            provenance,
        }
    }

    /// Attach a user rating to a stored analysis and fold it into statistics.
    ///
    /// Re-rating an analysis replaces its earlier rating in the variant's
    /// statistics instead of adding a sample.
    pub async fn rate_outcome(
        &self,
        outcome_id: &str,
        rating: Option<i64>,
        helpful: Option<bool>,
    ) -> AppResult<()> {
        let rating = rating.filter(|r| (1..=5).contains(r));

        let previous = self
            .storage
            .update_outcome_feedback(outcome_id, rating, helpful)
            .await?;
        self.metrics
            .revise_rating(
                &previous.variant_version,
                (previous.user_rating.map(|r| r as f64), previous.helpful),
                rating.map(|r| r as f64),
                helpful,
            )
            .await;
        Ok(())
    }

    /// Attach community consensus to a stored analysis.
    ///
    /// Consensus is re-sent as votes arrive; each outcome contributes one
    /// delta, kept current with the latest trusted consensus.
    pub async fn record_community(&self, outcome_id: &str, avg: f64, count: i64) -> AppResult<()> {
        let previous = self
            .storage
            .update_outcome_community(outcome_id, avg, count)
            .await?;
        if let Some(score) = previous.score.filter(|_| !previous.is_fallback) {
            self.metrics
                .revise_community_delta(
                    &previous.variant_version,
                    score,
                    (previous.community_avg, previous.community_count),
                    avg,
                    count,
                )
                .await;
        }
        Ok(())
    }

    /// Store a question a user asked after a result.
    pub async fn record_follow_up(&self, question: impl Into<String>) -> AppResult<()> {
        self.storage
            .insert_follow_up(&FollowUpQuestion::new(question))
            .await?;
        Ok(())
    }

    /// Store a community comparison vote tally.
    pub async fn record_comparison(&self, post: &ComparisonPost) -> AppResult<()> {
        self.storage.insert_comparison(post).await?;
        Ok(())
    }
}
