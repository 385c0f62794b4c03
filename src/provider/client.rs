use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{GenerateRequest, GenerateResponse, WireRequest, WireResponse};
use super::GenerationProvider;
use crate::config::{ProviderConfig, RequestConfig};
use crate::error::{ProviderError, ProviderResult};

/// Client for the `generateContent` REST API
#[derive(Clone)]
pub struct ProviderClient {
    client: Client,
    base_url: String,
    api_key: String,
    request_config: RequestConfig,
}

impl ProviderClient {
    /// Create a new provider client
    pub fn new(config: &ProviderConfig, request_config: RequestConfig) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(ProviderError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }
}

#[async_trait]
impl GenerationProvider for ProviderClient {
    async fn generate(&self, request: &GenerateRequest) -> ProviderResult<GenerateResponse> {
        let url = self.endpoint(&request.model);
        let timeout_ms = request
            .options
            .timeout_ms
            .unwrap_or(self.request_config.timeout_ms);

        debug!(
            model = %request.model,
            has_attachment = request.attachment.is_some(),
            max_tokens = request.options.max_output_tokens,
            "Calling generation provider"
        );

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .timeout(Duration::from_millis(timeout_ms))
            .json(&WireRequest::from(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout { timeout_ms }
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(
                model = %request.model,
                status = status.as_u16(),
                "Generation provider returned an error status"
            );
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let wire: WireResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        let candidate = wire
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse {
                message: "Response contained no candidates".to_string(),
            })?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        let usage = wire.usage_metadata.map(Into::into).unwrap_or_default();

        info!(
            model = %request.model,
            latency_ms = start.elapsed().as_millis(),
            finish_reason = candidate.finish_reason.as_deref().unwrap_or("unknown"),
            chars = text.len(),
            "Generation provider call succeeded"
        );

        Ok(GenerateResponse {
            text,
            usage,
            finish_reason: candidate.finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = ProviderConfig {
            api_key: "test_key".to_string(),
            ..ProviderConfig::default()
        };

        let client = ProviderClient::new(&config, RequestConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let config = ProviderConfig {
            api_key: "k".to_string(),
            base_url: "http://localhost:9999/".to_string(),
            ..ProviderConfig::default()
        };

        let client = ProviderClient::new(&config, RequestConfig::default()).unwrap();
        assert_eq!(client.base_url(), "http://localhost:9999");
        assert_eq!(
            client.endpoint("gemini-2.0-flash"),
            "http://localhost:9999/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }
}
