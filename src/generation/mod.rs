//! Resilient structured generation.
//!
//! [`GenerationClient::generate`] turns a provider call into a validated
//! value of some [`StructuredOutput`] type. Each attempt runs under a
//! timeout, is checked for degenerate repetition, has code fences stripped,
//! is parsed (with truncation repair as a second chance) and is checked for
//! required fields. When the attempt budget is spent the type's fixed
//! fallback is returned instead of an error.

mod feedback;
pub mod repair;

pub use feedback::{FeedbackPoint, FeedbackResult, GapReport, OccasionMatch, QuickFix, StyleDna};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::RequestConfig;
use crate::error::{GenerationError, ProviderError};
use crate::provider::{GenerateRequest, GenerationProvider, TokenUsage};

// ============================================================================
// Output contract
// ============================================================================

/// A JSON document type the generation client can produce.
pub trait StructuredOutput: DeserializeOwned + Serialize + Send + Sized {
    /// Short label for logs.
    const NAME: &'static str;

    /// Required top-level fields that are absent or mistyped in `value`.
    fn missing_required(value: &Value) -> Vec<&'static str>;

    /// Fill fields a truncated document lost with fixed defaults.
    fn backfill(value: Value) -> Value {
        value
    }

    /// Deterministic result returned when every attempt failed.
    fn fallback() -> Self;
}

/// Where a generated value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Provenance {
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Token usage summed over every attempt.
    pub usage: TokenUsage,
    /// Wall time across all attempts and backoff.
    pub latency_ms: u64,
}

/// Result of [`GenerationClient::generate`].
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome<T> {
    /// Output parsed and validated as-is.
    Valid { value: T, provenance: Provenance },
    /// Output was truncated; repaired and backfilled.
    Repaired { value: T, provenance: Provenance },
    /// Every attempt failed; `value` is the fixed fallback.
    Fallback {
        value: T,
        provenance: Provenance,
        last_error: String,
    },
}

impl<T> GenerationOutcome<T> {
    /// Borrow the value regardless of provenance.
    pub fn value(&self) -> &T {
        match self {
            Self::Valid { value, .. } | Self::Repaired { value, .. } | Self::Fallback { value, .. } => {
                value
            }
        }
    }

    /// Take the value regardless of provenance.
    pub fn into_value(self) -> T {
        match self {
            Self::Valid { value, .. } | Self::Repaired { value, .. } | Self::Fallback { value, .. } => {
                value
            }
        }
    }

    /// Provenance of the value.
    pub fn provenance(&self) -> Provenance {
        match self {
            Self::Valid { provenance, .. }
            | Self::Repaired { provenance, .. }
            | Self::Fallback { provenance, .. } => *provenance,
        }
    }

    /// Whether the value is the fallback.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    /// Whether the value came from repaired output.
    pub fn is_repaired(&self) -> bool {
        matches!(self, Self::Repaired { .. })
    }
}

// ============================================================================
// Health counters
// ============================================================================

/// Process-wide tallies of generation outcomes.
#[derive(Debug, Default)]
pub struct GenerationCounters {
    success: AtomicU64,
    repaired: AtomicU64,
    fallback: AtomicU64,
}

/// Point-in-time copy of [`GenerationCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    pub success: u64,
    pub repaired: u64,
    pub fallback: u64,
}

impl CounterSnapshot {
    /// Share of calls that ended in the fallback.
    pub fn fallback_rate(&self) -> f64 {
        let total = self.success + self.repaired + self.fallback;
        if total == 0 {
            0.0
        } else {
            self.fallback as f64 / total as f64
        }
    }
}

impl GenerationCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn record<T>(&self, outcome: &GenerationOutcome<T>) {
        let counter = match outcome {
            GenerationOutcome::Valid { .. } => &self.success,
            GenerationOutcome::Repaired { .. } => &self.repaired,
            GenerationOutcome::Fallback { .. } => &self.fallback,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            success: self.success.load(Ordering::Relaxed),
            repaired: self.repaired.load(Ordering::Relaxed),
            fallback: self.fallback.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Retrying, validating wrapper around a [`GenerationProvider`].
#[derive(Clone)]
pub struct GenerationClient {
    provider: Arc<dyn GenerationProvider>,
    request_config: RequestConfig,
    counters: Arc<GenerationCounters>,
}

struct AttemptSuccess<T> {
    value: T,
    repaired: bool,
}

impl GenerationClient {
    /// Create a client with its own counters.
    pub fn new(provider: Arc<dyn GenerationProvider>, request_config: RequestConfig) -> Self {
        Self::with_counters(provider, request_config, Arc::new(GenerationCounters::new()))
    }

    /// Create a client reporting into shared counters.
    pub fn with_counters(
        provider: Arc<dyn GenerationProvider>,
        request_config: RequestConfig,
        counters: Arc<GenerationCounters>,
    ) -> Self {
        Self {
            provider,
            request_config,
            counters,
        }
    }

    /// The counters this client reports into.
    pub fn counters(&self) -> &Arc<GenerationCounters> {
        &self.counters
    }

    /// Generate a validated `T`. Never fails: exhaustion yields `T::fallback()`.
    pub async fn generate<T: StructuredOutput>(
        &self,
        request: &GenerateRequest,
    ) -> GenerationOutcome<T> {
        let max_attempts = self.request_config.max_attempts.max(1);
        let start = Instant::now();
        let mut usage = TokenUsage::default();
        let mut last_error = String::from("no attempt made");
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;

            match self.attempt::<T>(request, &mut usage).await {
                Ok(success) => {
                    let provenance = Provenance {
                        attempts,
                        usage,
                        latency_ms: start.elapsed().as_millis() as u64,
                    };
                    info!(
                        output = T::NAME,
                        attempt = attempts,
                        repaired = success.repaired,
                        latency_ms = provenance.latency_ms,
                        "Structured generation succeeded"
                    );
                    let outcome = if success.repaired {
                        GenerationOutcome::Repaired {
                            value: success.value,
                            provenance,
                        }
                    } else {
                        GenerationOutcome::Valid {
                            value: success.value,
                            provenance,
                        }
                    };
                    self.counters.record(&outcome);
                    return outcome;
                }
                Err(e) => {
                    warn!(
                        output = T::NAME,
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "Structured generation attempt failed"
                    );
                    last_error = e.to_string();

                    // Client errors (bad request, auth) will not improve on retry.
                    if let GenerationError::Transient(p) = &e {
                        if !p.is_transient() {
                            break;
                        }
                    }

                    if attempts < max_attempts {
                        let delay = Duration::from_millis(
                            self.request_config.retry_delay_ms * 2_u64.pow(attempts),
                        );
                        debug!(
                            output = T::NAME,
                            delay_ms = delay.as_millis(),
                            "Backing off before retry"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let outcome = GenerationOutcome::Fallback {
            value: T::fallback(),
            provenance: Provenance {
                attempts,
                usage,
                latency_ms: start.elapsed().as_millis() as u64,
            },
            last_error,
        };
        warn!(output = T::NAME, attempts, "Returning fallback result");
        self.counters.record(&outcome);
        outcome
    }

    async fn attempt<T: StructuredOutput>(
        &self,
        request: &GenerateRequest,
        usage: &mut TokenUsage,
    ) -> Result<AttemptSuccess<T>, GenerationError> {
        let timeout_ms = request
            .options
            .timeout_ms
            .unwrap_or(self.request_config.timeout_ms);

        let response = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.provider.generate(request),
        )
        .await
        .map_err(|_| ProviderError::Timeout { timeout_ms })??;

        *usage = usage.add(response.usage);

        if response.text.trim().is_empty() {
            return Err(GenerationError::Malformed {
                message: "empty completion".to_string(),
            });
        }

        if let Some(period) = repair::detect_degeneration(&response.text) {
            return Err(GenerationError::Degenerate { period });
        }

        let cleaned = repair::strip_code_fences(&response.text);

        let (value, repaired) = match serde_json::from_str::<Value>(cleaned) {
            Ok(v) => (v, false),
            Err(parse_err) => {
                let repaired = repair::repair_truncated_json(cleaned).ok_or_else(|| {
                    GenerationError::Malformed {
                        message: parse_err.to_string(),
                    }
                })?;
                let partial: Value =
                    serde_json::from_str(&repaired).map_err(|e| GenerationError::Malformed {
                        message: e.to_string(),
                    })?;
                debug!(output = T::NAME, "Truncated output repaired");
                (T::backfill(partial), true)
            }
        };

        let missing = T::missing_required(&value);
        if !missing.is_empty() {
            return Err(GenerationError::MissingFields {
                fields: missing.join(", "),
            });
        }

        let value = serde_json::from_value::<T>(value).map_err(|e| GenerationError::Malformed {
            message: e.to_string(),
        })?;

        Ok(AttemptSuccess { value, repaired })
    }
}
