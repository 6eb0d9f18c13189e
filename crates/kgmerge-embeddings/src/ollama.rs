//! Ollama embedding provider implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use kgmerge_core::error::{ErrorCode, KgError, KgResult};
use kgmerge_core::traits::{Embedder, EmbedderConfig};

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f64>,
}

/// Ollama embedding provider.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    config: EmbedderConfig,
}

impl OllamaEmbedder {
    /// Create a new Ollama embedder.
    pub fn new(config: EmbedderConfig) -> KgResult<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        let url = url::Url::parse(&base_url)
            .map_err(|e| KgError::Configuration(format!("Invalid Ollama URL: {}", e)))?;
        let endpoint = url
            .join("api/embeddings")
            .map_err(|e| KgError::Configuration(format!("Invalid Ollama URL: {}", e)))?;

        Ok(Self {
            client: Client::new(),
            endpoint: endpoint.to_string(),
            config,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> KgResult<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.config.model,
            prompt: text,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| KgError::Embedding {
                message: format!("Ollama request failed: {}", e),
                code: ErrorCode::EmbConnectionFailed,
                source: Some(Box::new(e)),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(KgError::embedding(format!("Ollama returned {}: {}", status, body)));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| KgError::embedding(format!("Failed to parse Ollama response: {}", e)))?;

        if body.embedding.is_empty() {
            return Err(KgError::embedding("No embedding found in Ollama response"));
        }

        // Convert f64 to f32
        Ok(body.embedding.into_iter().map(|v| v as f32).collect())
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dims
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
