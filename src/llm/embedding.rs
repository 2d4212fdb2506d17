use std::env;

use reqwest::Client;
use tracing::debug;

use super::client::{Endpoint, LlmError};
use super::types::{EmbeddingRequest, EmbeddingResponse};

pub const DEFAULT_EMBEDDING_BASE_URL: &str = "https://api.jina.ai/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "jina-embeddings-v3";

/// Text-to-vector oracle. Vectors are returned as-is; normalization happens at retrieval.
pub trait EmbeddingOracle {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    http: Client,
    endpoint: Endpoint,
}

impl EmbeddingClient {
    pub fn new(http: Client, endpoint: Endpoint) -> Self {
        Self { http, endpoint }
    }

    /// Reads `EMBEDDING_API_KEY` (falling back to `LLM_API_KEY`), `EMBEDDING_BASE_URL`
    /// and `EMBEDDING_MODEL`.
    pub fn from_env(http: Client) -> Result<Self, LlmError> {
        let api_key = env::var("EMBEDDING_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| env::var("LLM_API_KEY").ok());
        let endpoint = Endpoint::resolve(
            "EMBEDDING_API_KEY",
            api_key,
            env::var("EMBEDDING_BASE_URL").ok(),
            env::var("EMBEDDING_MODEL").ok(),
            (DEFAULT_EMBEDDING_BASE_URL, DEFAULT_EMBEDDING_MODEL),
        )?;
        Ok(Self::new(http, endpoint))
    }
}

impl EmbeddingOracle for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let request = EmbeddingRequest {
            model: self.endpoint.model(),
            input: [text],
        };
        let response: EmbeddingResponse = self
            .endpoint
            .post(&self.http, "/embeddings", &request)
            .await?;

        let vector = response
            .data
            .and_then(|data| data.into_iter().next())
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        debug!(dims = vector.len(), "embedding received");
        Ok(vector)
    }
}
