//! Transport to the external generative-inference provider.
//!
//! [`GenerationProvider`] is the seam the rest of the crate talks to;
//! [`ProviderClient`] implements it over the `generateContent` REST API.
//! A single call is a single attempt: retry policy lives in
//! [`crate::generation`].

mod client;
mod types;

pub use client::ProviderClient;
pub use types::{
    Attachment, GenerateRequest, GenerateResponse, GenerationOptions, TokenUsage,
};

use async_trait::async_trait;

use crate::error::ProviderResult;

/// Something that turns a [`GenerateRequest`] into raw model text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Perform one generation call.
    async fn generate(&self, request: &GenerateRequest) -> ProviderResult<GenerateResponse>;
}
