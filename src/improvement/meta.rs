//! Meta-generation: asking the provider to author an improved variant.

use std::sync::Arc;
use tracing::{info, warn};

use super::PerformanceMetrics;
use crate::error::MetaGenerationError;
use crate::generation::repair::strip_code_fences;
use crate::knowledge::WeaknessReport;
use crate::prompts::{build_meta_prompt, MetaPromptInput};
use crate::provider::{GenerateRequest, GenerationProvider};
use crate::storage::DiscoveredRule;

const META_TEMPERATURE: f32 = 0.4;
const META_MAX_TOKENS: u32 = 16384;

/// A validated candidate text and the rules it was authored from.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaCandidate {
    pub text: String,
    pub rule_ids: Vec<String>,
}

/// Check a candidate against structural markers and minimum length.
///
/// Length is measured in characters, relative to `original`.
pub fn validate_candidate(
    candidate: &str,
    original: &str,
    required_markers: &[String],
    min_length_ratio: f64,
) -> Result<(), MetaGenerationError> {
    if candidate.trim().is_empty() {
        return Err(MetaGenerationError::EmptyOutput);
    }

    let missing: Vec<&str> = required_markers
        .iter()
        .filter(|m| !candidate.contains(m.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(MetaGenerationError::MissingMarkers {
            markers: missing.join(", "),
        });
    }

    let length = candidate.chars().count();
    let required = (original.chars().count() as f64 * min_length_ratio).ceil() as usize;
    if length < required {
        return Err(MetaGenerationError::TooShort { length, required });
    }

    Ok(())
}

/// Authors improved variants with a large-output provider call.
#[derive(Clone)]
pub struct MetaGenerator {
    provider: Arc<dyn GenerationProvider>,
    model: String,
    required_markers: Vec<String>,
    min_length_ratio: f64,
    timeout_ms: u64,
}

impl MetaGenerator {
    /// Create a meta-generator.
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        model: impl Into<String>,
        required_markers: Vec<String>,
        min_length_ratio: f64,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            required_markers,
            min_length_ratio,
            // Long outputs need more than the default request budget
            timeout_ms: 120_000,
        }
    }

    /// Override the provider call timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Produce and validate an improved version of `current`.
    pub async fn generate(
        &self,
        current: &str,
        report: &WeaknessReport,
        rules: &[DiscoveredRule],
        metrics: &PerformanceMetrics,
    ) -> Result<MetaCandidate, MetaGenerationError> {
        let weaknesses: Vec<String> = report
            .weaknesses
            .iter()
            .chain(report.calibration_issues.iter())
            .cloned()
            .collect();

        let instruction = build_meta_prompt(&MetaPromptInput {
            metrics_section: metrics.summary_lines().join("\n"),
            weaknesses: &weaknesses,
            low_performing: &report.low_performing,
            calibration_issues: &report.calibration_issues,
            rules,
        });
        let prompt = format!("{}\n\n=== CURRENT SYSTEM PROMPT ===\n\n{}", instruction, current);

        let request = GenerateRequest::new(&self.model, prompt)
            .with_text_output()
            .with_temperature(META_TEMPERATURE)
            .with_max_tokens(META_MAX_TOKENS)
            .with_timeout_ms(self.timeout_ms);

        let response = self.provider.generate(&request).await?;
        let text = strip_code_fences(response.text.trim()).trim().to_string();

        if let Err(e) = validate_candidate(&text, current, &self.required_markers, self.min_length_ratio)
        {
            warn!(error = %e, length = text.len(), "Candidate rejected");
            return Err(e);
        }

        info!(
            length = text.chars().count(),
            original = current.chars().count(),
            rules = rules.len(),
            tokens = response.usage.total_tokens,
            "Candidate generated"
        );
        Ok(MetaCandidate {
            text,
            rule_ids: rules.iter().map(|r| r.id.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImprovementConfig;
    use crate::error::ProviderError;
    use crate::prompts::BASELINE_VARIANT;
    use crate::provider::{GenerateResponse, MockGenerationProvider, TokenUsage};

    fn markers() -> Vec<String> {
        ImprovementConfig::default().required_markers
    }

    fn generator(reply: Result<String, u16>) -> MetaGenerator {
        let mut mock = MockGenerationProvider::new();
        mock.expect_generate().times(1).returning(move |req| {
            assert!(req.prompt.contains("=== CURRENT SYSTEM PROMPT ==="));
            match &reply {
                Ok(text) => Ok(GenerateResponse {
                    text: text.clone(),
                    usage: TokenUsage::default(),
                    finish_reason: Some("STOP".to_string()),
                }),
                Err(status) => Err(ProviderError::Api {
                    status: *status,
                    message: "boom".to_string(),
                }),
            }
        });
        MetaGenerator::new(Arc::new(mock), "meta", markers(), 0.8)
    }

    #[test]
    fn test_validate_markers_and_length() {
        let original = "x".repeat(100);
        let ok = format!("PERSONALITY: RESPONSE FORMAT: overallScore styleDNA {}", "y".repeat(40));
        assert!(validate_candidate(&ok, &original, &markers(), 0.8).is_ok());

        let err = validate_candidate("PERSONALITY: overallScore", "", &markers(), 0.8).unwrap_err();
        assert!(matches!(
            err,
            MetaGenerationError::MissingMarkers { ref markers } if markers == "RESPONSE FORMAT:, styleDNA"
        ));

        let short = "PERSONALITY: RESPONSE FORMAT: overallScore styleDNA";
        let err = validate_candidate(short, &original, &markers(), 0.8).unwrap_err();
        assert!(matches!(err, MetaGenerationError::TooShort { required: 80, .. }));

        assert!(matches!(
            validate_candidate("   ", "", &markers(), 0.8),
            Err(MetaGenerationError::EmptyOutput)
        ));
    }

    #[tokio::test]
    async fn test_generate_accepts_valid_candidate() {
        let improved = format!("{}\n\nOCCASION GUIDE:\nWeddings call for...", BASELINE_VARIANT);
        let meta = generator(Ok(improved.clone()));
        let rules = vec![DiscoveredRule::new("color", "navy + rust", 0.6, 12, "12 outfits")];

        let candidate = meta
            .generate(
                BASELINE_VARIANT,
                &WeaknessReport::default(),
                &rules,
                &PerformanceMetrics::default(),
            )
            .await
            .unwrap();
        assert_eq!(candidate.text, improved);
        assert_eq!(candidate.rule_ids, vec![rules[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_generate_rejects_truncated_candidate() {
        let meta = generator(Ok("PERSONALITY: RESPONSE FORMAT: overallScore styleDNA".to_string()));
        let err = meta
            .generate(
                BASELINE_VARIANT,
                &WeaknessReport::default(),
                &[],
                &PerformanceMetrics::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaGenerationError::TooShort { .. }));
    }

    #[tokio::test]
    async fn test_generate_surfaces_provider_error() {
        let meta = generator(Err(503));
        let err = meta
            .generate(
                BASELINE_VARIANT,
                &WeaknessReport::default(),
                &[],
                &PerformanceMetrics::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaGenerationError::Provider(_)));
    }
}
