//! # variant-lab
//!
//! A self-improving prompt-variant system. Requests are served by one of
//! several competing system-prompt variants; outcomes are measured per
//! variant, and a periodic improvement loop mines patterns from the data,
//! asks a model to author a better variant, and runs it as a controlled
//! experiment against the live one.
//!
//! ## Architecture
//!
//! ```text
//! request ──► TrafficAllocator ──► GenerationClient ──► provider (HTTP)
//!                   │                     │
//!                   ▼                     ▼
//!            VariantRegistry       MetricsAggregator
//!                   ▲                     │
//!                   │                     ▼
//!   Orchestrator ───┼──► KnowledgeMiner ◄── SQLite (variants, outcomes,
//!        │          │                        rules, cycles, snapshots)
//!        ├──► MetaGenerator
//!        └──► DecisionEngine (promote / kill / ramp)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use variant_lab::{Config, AppState};
//! use variant_lab::provider::ProviderClient;
//! use variant_lab::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let provider = ProviderClient::new(&config.provider, config.request.clone())?;
//!     let state = AppState::new(config, Arc::new(storage), Arc::new(provider));
//!     let outcome = state.orchestrator.check_and_trigger().await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

/// Command-line interface.
pub mod cli;
/// Configuration management.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Experiment evaluation and the promote/kill/ramp decision.
pub mod experiment;
/// Resilient structured generation.
pub mod generation;
/// Measurement, diagnosis and the improvement loop.
pub mod improvement;
/// Pattern mining over recorded outcomes.
pub mod knowledge;
/// Per-variant running statistics.
pub mod metrics;
/// Baseline variant and prompt builders.
pub mod prompts;
/// Generation provider client.
pub mod provider;
/// Variant lifecycle and traffic allocation.
pub mod registry;
/// Application wiring and the serving path.
pub mod service;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use service::{AppState, SharedState};
