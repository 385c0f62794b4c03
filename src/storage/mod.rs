//! Storage layer for variants, outcomes and improvement history.
//!
//! This module provides SQLite-based storage for prompt variants and their
//! running statistics, analysis outcome records, discovered rules,
//! improvement cycles, calibration snapshots, and the auxiliary signals
//! (follow-up questions, comparison votes) the knowledge miner reads.

mod sqlite;


pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

// ============================================================================
// Variants
// ============================================================================

/// How a variant came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariantSource {
    /// Hardcoded baseline text shipped with the binary.
    Baseline,
    /// Registered by an operator or self-registered live text.
    Manual,
    /// Authored by the meta-generator.
    AutoOptimize,
    /// Cohort-specific override.
    Cohort,
}

impl VariantSource {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantSource::Baseline => "baseline",
            VariantSource::Manual => "manual",
            VariantSource::AutoOptimize => "auto-optimize",
            VariantSource::Cohort => "cohort",
        }
    }
}

impl std::fmt::Display for VariantSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for VariantSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "baseline" => Ok(VariantSource::Baseline),
            "manual" => Ok(VariantSource::Manual),
            "auto-optimize" => Ok(VariantSource::AutoOptimize),
            "cohort" => Ok(VariantSource::Cohort),
            _ => Err(format!("Unknown variant source: {}", s)),
        }
    }
}

/// A versioned piece of instruction text served to the generation provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Unique version label.
    pub version: String,
    /// Version this variant was derived from.
    pub parent_version: Option<String>,
    /// Cohort key; `None` means the global pool.
    pub cohort: Option<String>,
    /// Opaque instruction text.
    pub text: String,
    /// Relative routing weight (0-100).
    pub traffic_pct: i64,
    /// Whether the variant can receive traffic.
    pub is_active: bool,
    /// Whether the variant is an experiment under evaluation.
    pub is_candidate: bool,
    /// Origin of the variant.
    pub source: VariantSource,
    /// Outcomes recorded against this variant.
    pub sample_size: i64,
    /// Running mean of generated scores.
    pub avg_score: Option<f64>,
    /// Ratings recorded against this variant.
    pub rating_count: i64,
    /// Running mean of user ratings (1-5).
    pub avg_user_rating: Option<f64>,
    /// Helpful votes that said yes.
    pub helpful_count: i64,
    /// Helpful votes cast.
    pub helpful_votes: i64,
    /// Community deltas recorded against this variant.
    pub community_delta_count: i64,
    /// Running mean of |score - community consensus|.
    pub avg_community_delta: Option<f64>,
    /// Discovered rules supplied when this variant was authored.
    pub source_rule_ids: Vec<String>,
    /// When the variant won an experiment.
    pub promoted_at: Option<DateTime<Utc>>,
    /// When the variant was registered.
    pub created_at: DateTime<Utc>,
}

impl Variant {
    /// Create an active, zero-traffic, non-candidate variant.
    pub fn new(version: impl Into<String>, text: impl Into<String>, source: VariantSource) -> Self {
        Self {
            version: version.into(),
            parent_version: None,
            cohort: None,
            text: text.into(),
            traffic_pct: 0,
            is_active: true,
            is_candidate: false,
            source,
            sample_size: 0,
            avg_score: None,
            rating_count: 0,
            avg_user_rating: None,
            helpful_count: 0,
            helpful_votes: 0,
            community_delta_count: 0,
            avg_community_delta: None,
            source_rule_ids: Vec::new(),
            promoted_at: None,
            created_at: Utc::now(),
        }
    }

    /// Set the parent version.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_version = Some(parent.into());
        self
    }

    /// Restrict the variant to a cohort.
    pub fn with_cohort(mut self, cohort: impl Into<String>) -> Self {
        self.cohort = Some(cohort.into());
        self
    }

    /// Set the routing weight.
    pub fn with_traffic(mut self, pct: i64) -> Self {
        self.traffic_pct = pct.clamp(0, 100);
        self
    }

    /// Mark as an experiment candidate.
    pub fn as_candidate(mut self) -> Self {
        self.is_candidate = true;
        self
    }

    /// Record the rules the variant was authored from.
    pub fn with_rule_ids(mut self, ids: Vec<String>) -> Self {
        self.source_rule_ids = ids;
        self
    }

    /// Fraction of helpful votes that were positive.
    pub fn helpful_rate(&self) -> Option<f64> {
        if self.helpful_votes == 0 {
            None
        } else {
            Some(self.helpful_count as f64 / self.helpful_votes as f64)
        }
    }

    /// Helpful rate as a percentage.
    pub fn helpful_pct(&self) -> Option<f64> {
        self.helpful_rate().map(|r| r * 100.0)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Attributes extracted from an analysis, used by the knowledge miner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    /// Dominant colors, lowercase.
    #[serde(default)]
    pub dominant_colors: Vec<String>,
    /// Style archetypes, lowercase.
    #[serde(default)]
    pub style_archetypes: Vec<String>,
    /// Formality level 1-5.
    pub formality_level: Option<i64>,
    /// Silhouette label.
    pub silhouette_type: Option<String>,
}

/// A persisted analysis outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Unique record identifier.
    pub id: String,
    /// Variant that produced the analysis.
    pub variant_version: String,
    /// Requesting user, when known. Drives cohort clustering.
    pub user_id: Option<String>,
    /// Generated score (1-10).
    pub score: Option<f64>,
    /// User rating (1-5).
    pub user_rating: Option<i64>,
    /// Helpful vote.
    pub helpful: Option<bool>,
    /// Community consensus score.
    pub community_avg: Option<f64>,
    /// Number of community votes behind the consensus.
    pub community_count: i64,
    /// Occasion-like tags.
    pub categories: Vec<String>,
    /// Extracted attributes.
    pub profile: Option<StyleProfile>,
    /// Whether the stored result was the deterministic fallback.
    pub is_fallback: bool,
    /// When the analysis was produced.
    pub created_at: DateTime<Utc>,
}

/// Community consensus needs this many votes before it is trusted.
pub const MIN_COMMUNITY_VOTES: i64 = 3;

impl OutcomeRecord {
    /// Create a new outcome record.
    pub fn new(variant_version: impl Into<String>, score: Option<f64>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            variant_version: variant_version.into(),
            user_id: None,
            score,
            user_rating: None,
            helpful: None,
            community_avg: None,
            community_count: 0,
            categories: Vec::new(),
            profile: None,
            is_fallback: false,
            created_at: Utc::now(),
        }
    }

    /// Attach the requesting user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach category tags.
    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    /// Attach an extracted profile.
    pub fn with_profile(mut self, profile: StyleProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Attach user feedback.
    pub fn with_rating(mut self, rating: Option<i64>, helpful: Option<bool>) -> Self {
        self.user_rating = rating;
        self.helpful = helpful;
        self
    }

    /// Attach community consensus.
    pub fn with_community(mut self, avg: f64, count: i64) -> Self {
        self.community_avg = Some(avg);
        self.community_count = count;
        self
    }

    /// Flag the record as a fallback result.
    pub fn as_fallback(mut self) -> Self {
        self.is_fallback = true;
        self
    }

    /// Override the creation time.
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Trusted community consensus, if any.
    pub fn trusted_community(&self) -> Option<f64> {
        match self.community_avg {
            Some(avg) if self.community_count >= MIN_COMMUNITY_VOTES => Some(avg),
            _ => None,
        }
    }

    /// Score minus trusted consensus.
    pub fn signed_community_delta(&self) -> Option<f64> {
        Some(self.score? - self.trusted_community()?)
    }

    /// |score - trusted consensus|.
    pub fn community_delta(&self) -> Option<f64> {
        self.signed_community_delta().map(f64::abs)
    }
}

// ============================================================================
// Discovered rules
// ============================================================================

/// A statistically supported pattern mined from outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredRule {
    /// Unique rule identifier.
    pub id: String,
    /// Dimension the rule describes (color, archetype, proportion, occasion).
    pub category: String,
    /// Natural-language rule text, unique.
    pub rule: String,
    /// Confidence 0-1.
    pub confidence: f64,
    /// Records behind the rule.
    pub sample_size: i64,
    /// Short human-readable evidence.
    pub evidence: String,
    /// Whether a promoted variant has absorbed the rule.
    pub incorporated: bool,
    /// Version that absorbed the rule.
    pub incorporated_in: Option<String>,
    /// When the rule was discovered.
    pub created_at: DateTime<Utc>,
}

impl DiscoveredRule {
    /// Create a new, unincorporated rule.
    pub fn new(
        category: impl Into<String>,
        rule: impl Into<String>,
        confidence: f64,
        sample_size: i64,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category: category.into(),
            rule: rule.into(),
            confidence: confidence.clamp(0.0, 1.0),
            sample_size,
            evidence: evidence.into(),
            incorporated: false,
            incorporated_in: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Improvement cycles
// ============================================================================

/// Why an improvement cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleTrigger {
    /// Periodic discovery run.
    Scheduled,
    /// Measured quality fell below thresholds.
    QualityDrop,
    /// Operator request.
    Manual,
}

impl CycleTrigger {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleTrigger::Scheduled => "scheduled",
            CycleTrigger::QualityDrop => "quality-drop",
            CycleTrigger::Manual => "manual",
        }
    }
}

impl std::fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CycleTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "scheduled" => Ok(CycleTrigger::Scheduled),
            "quality-drop" => Ok(CycleTrigger::QualityDrop),
            "manual" => Ok(CycleTrigger::Manual),
            _ => Err(format!("Unknown cycle trigger: {}", s)),
        }
    }
}

/// Lifecycle state of an improvement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// In progress.
    Running,
    /// Finished, with or without a candidate.
    Completed,
    /// Aborted by an error or rejected candidate.
    Failed,
}

impl CycleStatus {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Running => "running",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(CycleStatus::Running),
            "completed" => Ok(CycleStatus::Completed),
            "failed" => Ok(CycleStatus::Failed),
            _ => Err(format!("Unknown cycle status: {}", s)),
        }
    }
}

/// One run of the improvement orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementCycle {
    /// Unique cycle identifier.
    pub id: String,
    /// Why the cycle ran.
    pub trigger: CycleTrigger,
    /// Current state.
    pub status: CycleStatus,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// When the cycle reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Live version measured.
    pub source_version: Option<String>,
    /// Candidate registered, if any.
    pub candidate_version: Option<String>,
    /// Measured metrics at cycle start.
    pub trigger_metrics: Option<serde_json::Value>,
    /// Weaknesses found during diagnosis.
    pub weaknesses_found: Vec<String>,
    /// Discovery results.
    pub knowledge_extracted: Option<serde_json::Value>,
    /// Append-only progress log.
    pub log: Vec<String>,
}

impl ImprovementCycle {
    /// Create a running cycle.
    pub fn new(trigger: CycleTrigger) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trigger,
            status: CycleStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            source_version: None,
            candidate_version: None,
            trigger_metrics: None,
            weaknesses_found: Vec::new(),
            knowledge_extracted: None,
            log: Vec::new(),
        }
    }

    /// Append a line to the cycle log.
    pub fn log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    /// Move to a terminal state.
    pub fn finish(&mut self, status: CycleStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

// ============================================================================
// Auxiliary signals
// ============================================================================

/// Weekly comparison between generated scores and community consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    /// ISO week label, e.g. `2026-W07`.
    pub period: String,
    /// Paired records used.
    pub sample_size: i64,
    /// Mean generated score.
    pub avg_score: f64,
    /// Mean community consensus.
    pub avg_community: f64,
    /// `avg_score - avg_community`.
    pub delta: f64,
    /// Pearson correlation between the two.
    pub correlation: Option<f64>,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// A free-text question a user asked after receiving a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    /// Unique identifier.
    pub id: String,
    /// The question text.
    pub question: String,
    /// When it was asked.
    pub created_at: DateTime<Utc>,
}

impl FollowUpQuestion {
    /// Create a new follow-up question.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            question: question.into(),
            created_at: Utc::now(),
        }
    }
}

/// A community A/B vote between two looks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonPost {
    /// Unique identifier.
    pub id: String,
    /// Occasion-like tags.
    pub categories: Vec<String>,
    /// Votes for the first look.
    pub votes_a: i64,
    /// Votes for the second look.
    pub votes_b: i64,
    /// When the post was created.
    pub created_at: DateTime<Utc>,
}

impl ComparisonPost {
    /// Create a new comparison post.
    pub fn new(categories: Vec<String>, votes_a: i64, votes_b: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            categories,
            votes_a,
            votes_b,
            created_at: Utc::now(),
        }
    }

    /// Total votes cast.
    pub fn total_votes(&self) -> i64 {
        self.votes_a + self.votes_b
    }

    /// Share of votes taken by the winning side.
    pub fn winner_share(&self) -> Option<f64> {
        let total = self.total_votes();
        if total <= 0 {
            return None;
        }
        Some(self.votes_a.max(self.votes_b) as f64 / total as f64)
    }
}

// ============================================================================
// Storage trait
// ============================================================================

/// Persistence collaborator for the whole crate.
#[async_trait]
pub trait Storage: Send + Sync {
    // Variant operations

    /// Insert a new variant.
    async fn insert_variant(&self, variant: &Variant) -> StorageResult<()>;
    /// Fetch a variant by version.
    async fn get_variant(&self, version: &str) -> StorageResult<Option<Variant>>;
    /// All variants, newest first.
    async fn list_variants(&self) -> StorageResult<Vec<Variant>>;
    /// Active variants in a cohort (`None` = global pool), highest traffic first.
    async fn active_variants(&self, cohort: Option<&str>) -> StorageResult<Vec<Variant>>;
    /// Active candidates across all cohorts.
    async fn active_candidates(&self) -> StorageResult<Vec<Variant>>;
    /// Number of variants derived from `parent`.
    async fn count_children(&self, parent: &str) -> StorageResult<i64>;
    /// Number of variants for `cohort` created at or after `since`.
    async fn count_cohort_variants_since(
        &self,
        cohort: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;
    /// Deactivate every active variant of `cohort` except `keep`.
    async fn retire_cohort_variants(&self, cohort: &str, keep: &str) -> StorageResult<u64>;
    /// Overwrite lifecycle fields of a variant.
    async fn set_variant_state(
        &self,
        version: &str,
        is_active: bool,
        is_candidate: bool,
        traffic_pct: i64,
        promoted_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()>;
    /// Set only the routing weight.
    async fn set_traffic(&self, version: &str, traffic_pct: i64) -> StorageResult<()>;
    /// Fold one score into the running mean. Returns false for unknown versions.
    async fn record_variant_score(&self, version: &str, score: f64) -> StorageResult<bool>;
    /// Fold a rating and/or helpful vote into the running statistics.
    async fn record_variant_rating(
        &self,
        version: &str,
        rating: Option<f64>,
        helpful: Option<bool>,
    ) -> StorageResult<bool>;
    /// Fold a community delta into the running mean.
    async fn record_variant_delta(&self, version: &str, delta: f64) -> StorageResult<bool>;
    /// Swap one already-counted rating for another without changing the count.
    async fn replace_variant_rating(
        &self,
        version: &str,
        previous: f64,
        rating: f64,
    ) -> StorageResult<bool>;
    /// Swap one already-counted helpful vote for another.
    async fn replace_variant_helpful(
        &self,
        version: &str,
        previous: bool,
        helpful: bool,
    ) -> StorageResult<bool>;
    /// Swap an already-counted community delta, or retract it when `delta` is `None`.
    async fn replace_variant_delta(
        &self,
        version: &str,
        previous: f64,
        delta: Option<f64>,
    ) -> StorageResult<bool>;
    /// Retire `control` (when given) and make `candidate` the sole live variant,
    /// in one transaction.
    async fn promote_variant(
        &self,
        candidate: &str,
        control: Option<&str>,
        promoted_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    // Outcome operations

    /// Insert an outcome record.
    async fn insert_outcome(&self, outcome: &OutcomeRecord) -> StorageResult<()>;
    /// Fetch an outcome record by id.
    async fn get_outcome(&self, id: &str) -> StorageResult<Option<OutcomeRecord>>;
    /// Attach user feedback to a record. `None` keeps the stored value.
    ///
    /// Returns the record as it was before the update.
    async fn update_outcome_feedback(
        &self,
        id: &str,
        rating: Option<i64>,
        helpful: Option<bool>,
    ) -> StorageResult<OutcomeRecord>;
    /// Attach community consensus to a record, returning the previous record.
    async fn update_outcome_community(
        &self,
        id: &str,
        avg: f64,
        count: i64,
    ) -> StorageResult<OutcomeRecord>;
    /// Most recent records, newest first.
    async fn recent_outcomes(&self, limit: i64) -> StorageResult<Vec<OutcomeRecord>>;
    /// Records created at or after `since`, newest first.
    async fn outcomes_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<OutcomeRecord>>;

    // Rule operations

    /// Insert a rule unless its text already exists. Returns whether it was inserted.
    async fn insert_rule(&self, rule: &DiscoveredRule) -> StorageResult<bool>;
    /// All rules, newest first.
    async fn list_rules(&self) -> StorageResult<Vec<DiscoveredRule>>;
    /// Unincorporated rules at or above `min_confidence`, most confident first.
    async fn pending_rules(&self, min_confidence: f64, limit: i64)
        -> StorageResult<Vec<DiscoveredRule>>;
    /// Mark the given rules incorporated into `version`.
    async fn mark_rules_incorporated(&self, ids: &[String], version: &str) -> StorageResult<u64>;
    /// Mark every unincorporated rule incorporated into `version`.
    async fn mark_all_rules_incorporated(&self, version: &str) -> StorageResult<u64>;

    // Cycle operations

    /// Insert a cycle row.
    async fn insert_cycle(&self, cycle: &ImprovementCycle) -> StorageResult<()>;
    /// Persist the full state of a cycle.
    async fn update_cycle(&self, cycle: &ImprovementCycle) -> StorageResult<()>;
    /// Most recent cycles, newest first.
    async fn recent_cycles(&self, limit: i64) -> StorageResult<Vec<ImprovementCycle>>;
    /// Most recently started completed cycle.
    async fn latest_completed_cycle(&self) -> StorageResult<Option<ImprovementCycle>>;

    // Calibration operations

    /// Insert or replace the snapshot for its period.
    async fn upsert_snapshot(&self, snapshot: &CalibrationSnapshot) -> StorageResult<()>;
    /// Most recent snapshots, newest period first.
    async fn recent_snapshots(&self, limit: i64) -> StorageResult<Vec<CalibrationSnapshot>>;

    // Auxiliary signal operations

    /// Insert a follow-up question.
    async fn insert_follow_up(&self, question: &FollowUpQuestion) -> StorageResult<()>;
    /// Follow-up questions since `since`, newest first.
    async fn follow_ups_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<FollowUpQuestion>>;
    /// Insert a comparison post.
    async fn insert_comparison(&self, post: &ComparisonPost) -> StorageResult<()>;
    /// Most recent comparison posts, newest first.
    async fn recent_comparisons(&self, limit: i64) -> StorageResult<Vec<ComparisonPost>>;

    // Lease operations

    /// Take the named lease if free or expired. Returns whether it is now held by `holder`.
    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration)
        -> StorageResult<bool>;
    /// Release the named lease if held by `holder`.
    async fn release_lease(&self, name: &str, holder: &str) -> StorageResult<()>;
}
