//! Cohort specialization: per-archetype variants for large user clusters.
//!
//! Users are clustered by the two leading style archetypes of their most
//! recent profiled outcome. Each sizable cluster gets a variant whose text is
//! a short cohort-specific addition prepended to the live global variant.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MetaGenerationError;
use crate::generation::repair::strip_code_fences;
use crate::knowledge::mean;
use crate::prompts::{build_cohort_prompt, CohortPromptInput};
use crate::provider::{GenerateRequest, GenerationProvider};
use crate::registry::cohort_key;
use crate::storage::OutcomeRecord;

/// Lease guarding cohort cycles.
pub const COHORT_LEASE: &str = "cohort-improvement-cycle";

/// Outcomes scanned for clustering and cohort summaries.
pub const COHORT_SCAN_LIMIT: i64 = 2000;

/// A cohort with a variant younger than this is left alone.
pub const COHORT_COOLDOWN_DAYS: i64 = 14;

/// Rated outcomes a cohort needs before it is specialized.
pub const MIN_RATED_CHECKS: usize = 10;

const MIN_COHORT_USERS: usize = 20;
const MAX_COHORTS: usize = 8;
const MAX_RATED_CHECKS: usize = 100;
const TOP_OCCASIONS: usize = 3;
const MIN_ADDITION_CHARS: usize = 50;
const COHORT_TEMPERATURE: f32 = 0.5;
const COHORT_MAX_TOKENS: u32 = 512;

/// Users sharing a cohort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cohort {
    pub key: String,
    pub users: Vec<String>,
}

/// Rated activity of one cohort.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortSummary {
    pub key: String,
    /// Display form of the key, e.g. `Classic+Minimalist`.
    pub label: String,
    pub user_count: usize,
    /// Scored and rated outcomes behind the summary.
    pub checks: usize,
    pub avg_rating: f64,
    pub top_occasions: Vec<String>,
}

/// Why a cohort did not get a new variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CohortSkip {
    pub cohort: String,
    pub reason: String,
}

/// Result of one cohort cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CohortReport {
    /// Global variant the additions were prepended to.
    pub base_version: String,
    /// Cohorts large enough to consider.
    pub cohorts_found: usize,
    /// Versions created this run.
    pub created: Vec<String>,
    pub skipped: Vec<CohortSkip>,
}

/// Cluster users of `records` (newest first) by their latest profile.
///
/// Returns at most eight cohorts with twenty or more users, largest first.
pub fn cluster_cohorts(records: &[OutcomeRecord]) -> Vec<Cohort> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();

    for record in records {
        let Some(user) = record.user_id.as_deref() else {
            continue;
        };
        if seen.contains(user) {
            continue;
        }
        let Some(key) = record
            .profile
            .as_ref()
            .and_then(|p| cohort_key(&p.style_archetypes))
        else {
            continue;
        };
        seen.insert(user);
        groups.entry(key).or_default().push(user.to_string());
    }

    let mut cohorts: Vec<Cohort> = groups
        .into_iter()
        .filter(|(_, users)| users.len() >= MIN_COHORT_USERS)
        .map(|(key, users)| Cohort { key, users })
        .collect();
    cohorts.sort_by(|a, b| b.users.len().cmp(&a.users.len()).then_with(|| a.key.cmp(&b.key)));
    cohorts.truncate(MAX_COHORTS);
    cohorts
}

/// Display label for a cohort key: `classic-minimalist` becomes `Classic+Minimalist`.
pub fn cohort_label(key: &str) -> String {
    key.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join("+")
}

/// Summarize the newest scored and rated outcomes of `cohort`'s users.
pub fn summarize_cohort(cohort: &Cohort, records: &[OutcomeRecord]) -> CohortSummary {
    let members: HashSet<&str> = cohort.users.iter().map(String::as_str).collect();
    let rated: Vec<&OutcomeRecord> = records
        .iter()
        .filter(|r| {
            !r.is_fallback
                && r.score.is_some()
                && r.user_rating.is_some()
                && r.user_id.as_deref().is_some_and(|u| members.contains(u))
        })
        .take(MAX_RATED_CHECKS)
        .collect();

    let ratings: Vec<f64> = rated
        .iter()
        .filter_map(|r| r.user_rating.map(|v| v as f64))
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for occasion in rated.iter().flat_map(|r| r.categories.iter()) {
        *counts.entry(occasion.as_str()).or_default() += 1;
    }
    let mut occasions: Vec<(&str, usize)> = counts.into_iter().collect();
    occasions.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    CohortSummary {
        key: cohort.key.clone(),
        label: cohort_label(&cohort.key),
        user_count: cohort.users.len(),
        checks: rated.len(),
        avg_rating: mean(&ratings).unwrap_or(0.0),
        top_occasions: occasions
            .into_iter()
            .take(TOP_OCCASIONS)
            .map(|(o, _)| o.to_string())
            .collect(),
    }
}

/// Full cohort variant text: the addition under a cohort heading, then the base.
pub fn compose_cohort_text(label: &str, addition: &str, base: &str) -> String {
    format!("COHORT CONTEXT ({} aesthetic):\n{}\n\n{}", label, addition, base)
}

/// Authors cohort additions with a short, lightweight provider call.
#[derive(Clone)]
pub struct CohortGenerator {
    provider: Arc<dyn GenerationProvider>,
    model: String,
}

impl CohortGenerator {
    /// Create a cohort generator.
    pub fn new(provider: Arc<dyn GenerationProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Ask for an addition tailored to `summary`, based on `base_text`.
    pub async fn addition(
        &self,
        summary: &CohortSummary,
        base_text: &str,
    ) -> Result<String, MetaGenerationError> {
        let prompt = build_cohort_prompt(&CohortPromptInput {
            label: &summary.label,
            occasions: &summary.top_occasions,
            avg_rating: summary.avg_rating,
            sample_size: summary.checks,
            base_text,
        });
        let request = GenerateRequest::new(&self.model, prompt)
            .with_text_output()
            .with_temperature(COHORT_TEMPERATURE)
            .with_max_tokens(COHORT_MAX_TOKENS);

        let response = self.provider.generate(&request).await?;
        let text = strip_code_fences(response.text.trim()).trim().to_string();

        if text.is_empty() {
            return Err(MetaGenerationError::EmptyOutput);
        }
        let length = text.chars().count();
        if length < MIN_ADDITION_CHARS {
            warn!(cohort = %summary.key, length, "Cohort addition too short");
            return Err(MetaGenerationError::TooShort {
                length,
                required: MIN_ADDITION_CHARS,
            });
        }

        info!(cohort = %summary.key, length, "Cohort addition generated");
        Ok(text)
    }
}
