//! Application wiring.
//!
//! This module provides:
//! - [`AppState`], every component built once over shared storage and counters
//! - [`FeedbackService`], the request-serving path

mod feedback;

pub use feedback::{Analysis, AnalysisRequest, FeedbackService};

use std::sync::Arc;

use crate::config::Config;
use crate::experiment::DecisionEngine;
use crate::generation::{GenerationClient, GenerationCounters};
use crate::improvement::{CohortGenerator, MetaGenerator, Orchestrator};
use crate::knowledge::KnowledgeMiner;
use crate::metrics::MetricsAggregator;
use crate::provider::GenerationProvider;
use crate::registry::{TrafficAllocator, VariantRegistry};
use crate::storage::Storage;

/// Application state shared by the serving path and the scheduler.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Persistence collaborator.
    pub storage: Arc<dyn Storage>,
    /// Feedback generation success/repaired/fallback tallies.
    pub counters: Arc<GenerationCounters>,
    /// Tallies for the follow-up classifier, kept apart from serving health.
    pub classifier_counters: Arc<GenerationCounters>,
    /// Variant lifecycle.
    pub registry: VariantRegistry,
    /// Feedback-serving path.
    pub feedback: FeedbackService,
    /// Improvement loop and scheduler entry points.
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Build every component over `storage` and `provider`.
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        provider: Arc<dyn GenerationProvider>,
    ) -> Self {
        let counters = Arc::new(GenerationCounters::new());
        let client =
            GenerationClient::with_counters(provider.clone(), config.request.clone(), counters.clone());

        let metrics = MetricsAggregator::new(storage.clone());
        let registry = VariantRegistry::new(storage.clone(), config.experiment.clone());
        let allocator = TrafficAllocator::new(storage.clone());
        let engine = DecisionEngine::new(registry.clone(), storage.clone(), config.experiment.clone());
        let classifier_counters = Arc::new(GenerationCounters::new());
        let classifier = GenerationClient::with_counters(
            provider.clone(),
            config.request.clone(),
            classifier_counters.clone(),
        );
        let miner = KnowledgeMiner::new(
            storage.clone(),
            classifier,
            config.provider.classifier_model.clone(),
        );
        let cohort = CohortGenerator::new(provider.clone(), config.provider.classifier_model.clone());
        let meta = MetaGenerator::new(
            provider,
            config.provider.meta_model.clone(),
            config.improvement.required_markers.clone(),
            config.improvement.min_length_ratio,
        );

        let feedback = FeedbackService::new(
            storage.clone(),
            allocator,
            client,
            metrics,
            config.provider.generation_model.clone(),
        );
        let orchestrator = Orchestrator::new(
            storage.clone(),
            registry.clone(),
            engine,
            miner,
            meta,
            cohort,
            config.improvement.clone(),
        );

        tracing::info!(
            generation_model = %config.provider.generation_model,
            meta_model = %config.provider.meta_model,
            "Application state initialized"
        );

        Self {
            config,
            storage,
            counters,
            classifier_counters,
            registry,
            feedback,
            orchestrator,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
