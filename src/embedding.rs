//! The multilingual sentence encoder C3 calls to embed a retrieval
//! query. Modelled as a trait the same way the LLM client is — one
//! HTTP-backed production implementation, one deterministic fake for
//! tests — so the retriever never depends on a concrete inference
//! stack.

use crate::catalogue::vector::EMBEDDING_DIM;
use crate::error::{LcaError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[async_trait]
pub trait EmbeddingEncoder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// A thin HTTP client against the embedding service, analogous in
/// shape to [`crate::oracle::client::HttpLlmClient`].
pub struct HttpEmbeddingEncoder {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpEmbeddingEncoder {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self { endpoint, client: reqwest::Client::new(), timeout }
    }
}

#[async_trait]
impl EmbeddingEncoder for HttpEmbeddingEncoder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest { input: text })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| LcaError::LlmTransport { attempts: 1, source: e.into() })?;

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| LcaError::LlmMalformed(format!("embedding response: {e}")))?;

        if parsed.embedding.len() != EMBEDDING_DIM {
            return Err(LcaError::LlmMalformed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                parsed.embedding.len()
            )));
        }
        Ok(parsed.embedding)
    }
}

/// Deterministic hash-based embedding used in tests and as a
/// last-resort local fallback; semantically meaningless but stable,
/// so rank-fusion tests are reproducible without a model.
pub struct FallbackEmbeddingEncoder;

#[async_trait]
impl EmbeddingEncoder for FallbackEmbeddingEncoder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(crate::catalogue::fallback_embedding(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fallback_encoder_is_deterministic() {
        let encoder = FallbackEmbeddingEncoder;
        let a = encoder.embed("diesel verbrennung").await.unwrap();
        let b = encoder.embed("diesel verbrennung").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
    }
}
