//! Prompt gaps mined from the questions users ask after a result.

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::error::StorageResult;
use crate::generation::{GapReport, GenerationClient};
use crate::prompts::build_follow_up_prompt;
use crate::provider::GenerateRequest;
use crate::storage::Storage;

const LOOKBACK_DAYS: i64 = 14;
const MAX_QUESTIONS: i64 = 300;
const MIN_QUESTIONS: usize = 10;
const SAMPLE_SIZE: usize = 100;

/// Classify recent follow-up questions into feedback gaps.
///
/// Returns an empty list when there is too little data or the classifier
/// falls back.
pub async fn mine_follow_up_gaps(
    storage: &dyn Storage,
    client: &GenerationClient,
    model: &str,
) -> StorageResult<Vec<String>> {
    let since = Utc::now() - Duration::days(LOOKBACK_DAYS);
    let questions = storage.follow_ups_since(since, MAX_QUESTIONS).await?;

    if questions.len() < MIN_QUESTIONS {
        debug!(count = questions.len(), "Too few follow-up questions to mine");
        return Ok(Vec::new());
    }

    let sample: Vec<String> = questions
        .into_iter()
        .take(SAMPLE_SIZE)
        .map(|q| q.question)
        .collect();

    let request = GenerateRequest::new(model, build_follow_up_prompt(&sample))
        .with_temperature(0.3)
        .with_max_tokens(512);

    let outcome = client.generate::<GapReport>(&request).await;
    if outcome.is_fallback() {
        return Ok(Vec::new());
    }

    let gaps: Vec<String> = outcome
        .into_value()
        .gaps
        .into_iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .collect();
    info!(gaps = gaps.len(), sampled = sample.len(), "Follow-up gaps mined");
    Ok(gaps)
}
