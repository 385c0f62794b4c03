use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub experiment: ExperimentConfig,
    pub improvement: ImprovementConfig,
}

/// Generation provider configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    /// Model serving user-facing feedback.
    pub generation_model: String,
    /// Large-output model used to author candidate variants.
    pub meta_model: String,
    /// Lightweight model used for follow-up classification.
    pub classifier_model: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Provider request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    /// Total attempts per generation, including the first.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

/// Which discovered rules are marked incorporated when a candidate is promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleAttribution {
    /// Only rules the meta-generator was given for this candidate.
    #[default]
    UsedRules,
    /// Every rule not yet incorporated.
    AllUnincorporated,
}

impl FromStr for RuleAttribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "used" | "used_rules" => Ok(RuleAttribution::UsedRules),
            "all" | "all_unincorporated" => Ok(RuleAttribution::AllUnincorporated),
            _ => Err(format!("Unknown rule attribution: {}", s)),
        }
    }
}

/// Experiment decision thresholds
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Minimum outcomes on both sides before any decision.
    pub min_sample_size: i64,
    /// Rating improvement that promotes on its own.
    pub promote_rating_margin: f64,
    /// Delta improvement that promotes when rating did not regress.
    pub promote_delta_margin: f64,
    /// Rating change below which the candidate is killed.
    pub kill_rating_margin: f64,
    pub ramp_step_pct: i64,
    pub ramp_cap_pct: i64,
    pub candidate_traffic_pct: i64,
    pub control_traffic_pct: i64,
    pub rule_attribution: RuleAttribution,
}

/// Improvement cycle configuration
#[derive(Debug, Clone)]
pub struct ImprovementConfig {
    /// Outcome records scanned by the measure step.
    pub measure_window: i64,
    /// Records required before a cycle does anything.
    pub min_cycle_sample: usize,
    /// Average rating below which improvement is warranted.
    pub rating_floor: f64,
    /// Rule confidence at which a rule is fed to the meta-generator.
    pub rule_confidence_floor: f64,
    pub diagnose_window_days: i64,
    pub cooldown_days: i64,
    pub required_markers: Vec<String>,
    pub min_length_ratio: f64,
    pub lease_ttl_secs: i64,
    pub quality_drop: QualityDropThresholds,
}

/// Measured values that trigger an out-of-schedule cycle.
#[derive(Debug, Clone)]
pub struct QualityDropThresholds {
    pub min_avg_rating: f64,
    pub max_avg_delta: f64,
    pub min_helpful_rate: f64,
    pub max_fallback_rate: f64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = ProviderConfig::default();
        let provider = ProviderConfig {
            api_key: env::var("GENERATION_API_KEY").map_err(|_| AppError::Config {
                message: "GENERATION_API_KEY is required".to_string(),
            })?,
            base_url: env::var("GENERATION_BASE_URL").unwrap_or(defaults.base_url),
            generation_model: env::var("GENERATION_MODEL").unwrap_or(defaults.generation_model),
            meta_model: env::var("META_MODEL").unwrap_or(defaults.meta_model),
            classifier_model: env::var("CLASSIFIER_MODEL").unwrap_or(defaults.classifier_model),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/variants.db".to_string()),
            ),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env_or("REQUEST_TIMEOUT_MS", 30000),
            max_attempts: env_or("MAX_ATTEMPTS", 3),
            retry_delay_ms: env_or("RETRY_DELAY_MS", 1000),
        };

        Ok(Config {
            provider,
            database,
            logging,
            request,
            experiment: ExperimentConfig::from_env(),
            improvement: ImprovementConfig::from_env(),
        })
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            generation_model: "gemini-2.0-flash".to_string(),
            meta_model: "gemini-2.5-flash".to_string(),
            classifier_model: "gemini-2.5-flash-lite".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/variants.db"),
            max_connections: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 50,
            promote_rating_margin: 0.1,
            promote_delta_margin: 0.2,
            kill_rating_margin: -0.2,
            ramp_step_pct: 10,
            ramp_cap_pct: 40,
            candidate_traffic_pct: 10,
            control_traffic_pct: 90,
            rule_attribution: RuleAttribution::UsedRules,
        }
    }
}

impl ExperimentConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_sample_size: env_or("EXPERIMENT_MIN_SAMPLE", d.min_sample_size),
            promote_rating_margin: env_or("EXPERIMENT_PROMOTE_RATING", d.promote_rating_margin),
            promote_delta_margin: env_or("EXPERIMENT_PROMOTE_DELTA", d.promote_delta_margin),
            kill_rating_margin: env_or("EXPERIMENT_KILL_RATING", d.kill_rating_margin),
            ramp_step_pct: env_or("EXPERIMENT_RAMP_STEP", d.ramp_step_pct),
            ramp_cap_pct: env_or("EXPERIMENT_RAMP_CAP", d.ramp_cap_pct),
            candidate_traffic_pct: env_or("EXPERIMENT_CANDIDATE_TRAFFIC", d.candidate_traffic_pct),
            control_traffic_pct: env_or("EXPERIMENT_CONTROL_TRAFFIC", d.control_traffic_pct),
            rule_attribution: env_or("RULE_ATTRIBUTION", d.rule_attribution),
        }
    }
}

impl Default for QualityDropThresholds {
    fn default() -> Self {
        Self {
            min_avg_rating: 3.5,
            max_avg_delta: 1.5,
            min_helpful_rate: 0.6,
            max_fallback_rate: 0.1,
        }
    }
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            measure_window: 500,
            min_cycle_sample: 20,
            rating_floor: 4.0,
            rule_confidence_floor: 0.5,
            diagnose_window_days: 30,
            cooldown_days: 7,
            required_markers: ["PERSONALITY:", "RESPONSE FORMAT:", "overallScore", "styleDNA"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_length_ratio: 0.8,
            lease_ttl_secs: 900,
            quality_drop: QualityDropThresholds::default(),
        }
    }
}

impl ImprovementConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let required_markers = env::var("META_REQUIRED_MARKERS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|m| !m.is_empty())
            .unwrap_or(d.required_markers);

        Self {
            measure_window: env_or("IMPROVEMENT_MEASURE_WINDOW", d.measure_window),
            min_cycle_sample: env_or("IMPROVEMENT_MIN_SAMPLE", d.min_cycle_sample),
            rating_floor: env_or("IMPROVEMENT_RATING_FLOOR", d.rating_floor),
            rule_confidence_floor: env_or("IMPROVEMENT_RULE_CONFIDENCE", d.rule_confidence_floor),
            diagnose_window_days: env_or("IMPROVEMENT_DIAGNOSE_DAYS", d.diagnose_window_days),
            cooldown_days: env_or("IMPROVEMENT_COOLDOWN_DAYS", d.cooldown_days),
            required_markers,
            min_length_ratio: env_or("META_MIN_LENGTH_RATIO", d.min_length_ratio),
            lease_ttl_secs: env_or("IMPROVEMENT_LEASE_TTL_SECS", d.lease_ttl_secs),
            quality_drop: d.quality_drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_config_default() {
        let config = RequestConfig::default();
        assert_eq!(config.timeout_ms, 30000);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay_ms, 1000);
    }

    #[test]
    fn test_experiment_config_default() {
        let config = ExperimentConfig::default();
        assert_eq!(config.min_sample_size, 50);
        assert_eq!(config.ramp_cap_pct, 40);
        assert_eq!(config.candidate_traffic_pct + config.control_traffic_pct, 100);
        assert_eq!(config.rule_attribution, RuleAttribution::UsedRules);
    }

    #[test]
    fn test_improvement_config_default_markers() {
        let config = ImprovementConfig::default();
        assert_eq!(config.required_markers.len(), 4);
        assert!(config.required_markers.contains(&"styleDNA".to_string()));
        assert_eq!(config.min_cycle_sample, 20);
    }

    #[test]
    fn test_rule_attribution_from_str() {
        assert_eq!(
            "all".parse::<RuleAttribution>().unwrap(),
            RuleAttribution::AllUnincorporated
        );
        assert_eq!(
            "USED_RULES".parse::<RuleAttribution>().unwrap(),
            RuleAttribution::UsedRules
        );
        assert!("some".parse::<RuleAttribution>().is_err());
    }

    #[test]
    fn test_log_format_equality() {
        assert_eq!(LogFormat::Json, LogFormat::Json);
        assert_ne!(LogFormat::Json, LogFormat::Pretty);
    }
}
