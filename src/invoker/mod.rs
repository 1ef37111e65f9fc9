//! Remote model invocation.
//!
//! [`RemoteInvoker`] encodes a per-family request body, posts it through
//! the configured transport, and decodes the response. Timeouts come from
//! the timeout profile bounded by the caller's deadline; an already-spent
//! deadline fails before any network I/O.

mod families;
mod transport;

pub use families::{DecodedGeneration, decode_embedding, decode_generation, encode_embedding,
                   encode_generation};
pub use transport::{HttpTransport, ProviderTransport, SigV4Transport};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ModelSpec, TimeoutProfile};
use crate::deadline::Deadline;
use crate::types::TokenUsage;
use crate::{MimirError, Result};

/// A decoded generation with settled token accounting.
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub usage: TokenUsage,
}

/// Provider invocation seam. The gateway depends on this trait; tests
/// inject fakes through it.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Run a generation request against a catalogued model.
    async fn generate(
        &self,
        spec: &ModelSpec,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        deadline: Deadline,
    ) -> Result<Generation>;

    /// Produce an embedding from a catalogued embedding model.
    async fn embed(&self, spec: &ModelSpec, text: &str, deadline: Deadline) -> Result<Vec<f32>>;
}

/// Best-effort token estimate when the provider reports no usage.
///
/// Four characters per token is the conventional approximation.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4).max(if text.is_empty() { 0 } else { 1 }) as u32
}

/// The production invoker: family codecs over a provider transport.
pub struct RemoteInvoker {
    transport: Arc<dyn ProviderTransport>,
    timeouts: TimeoutProfile,
}

impl RemoteInvoker {
    pub fn new(transport: Arc<dyn ProviderTransport>, timeouts: TimeoutProfile) -> Self {
        Self { transport, timeouts }
    }

    /// The read/write budget for one call: profile bound, shrunk to the
    /// caller's remaining deadline.
    fn call_budget(&self, deadline: &Deadline) -> Result<std::time::Duration> {
        if deadline.expired() {
            return Err(deadline.to_timeout());
        }
        Ok(self.timeouts.request().min(deadline.remaining()))
    }
}

#[async_trait]
impl ModelInvoker for RemoteInvoker {
    async fn generate(
        &self,
        spec: &ModelSpec,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        deadline: Deadline,
    ) -> Result<Generation> {
        let family = spec
            .family()
            .ok_or_else(|| MimirError::ModelNotFound(spec.id.clone()))?;
        let budget = self.call_budget(&deadline)?;

        let body = encode_generation(family, prompt, temperature, max_tokens)?;
        let response = self
            .transport
            .invoke(&spec.id, serde_json::to_vec(&body)?, budget)
            .await?;
        let decoded = decode_generation(family, &response)?;

        let input = decoded
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(prompt));
        let output = decoded
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(&decoded.content));
        Ok(Generation {
            content: decoded.content,
            usage: TokenUsage::new(input, output),
        })
    }

    async fn embed(&self, spec: &ModelSpec, text: &str, deadline: Deadline) -> Result<Vec<f32>> {
        let family = spec
            .family()
            .ok_or_else(|| MimirError::ModelNotFound(spec.id.clone()))?;
        let budget = self.call_budget(&deadline)?;

        let body = encode_embedding(family, text)?;
        let response = self
            .transport
            .invoke(&spec.id, serde_json::to_vec(&body)?, budget)
            .await?;
        let vector = decode_embedding(family, &response)?;

        if let Some(dim) = spec.dimension
            && vector.len() != dim
        {
            return Err(MimirError::Protocol(format!(
                "model {} returned {} dimensions, expected {dim}",
                spec.id,
                vector.len()
            )));
        }
        Ok(vector)
    }
}
