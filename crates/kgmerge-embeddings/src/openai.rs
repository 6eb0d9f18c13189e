//! OpenAI embeddings for entity and relation text.

use async_trait::async_trait;

use kgmerge_core::error::{KgError, KgResult};
use kgmerge_core::traits::{Embedder, EmbedderConfig};

#[cfg(feature = "openai")]
use async_openai::{
    config::OpenAIConfig,
    types::{CreateEmbeddingRequest, EmbeddingInput},
    Client,
};

/// Embeds through the OpenAI API, or any server speaking its protocol.
pub struct OpenAIEmbedder {
    #[cfg(feature = "openai")]
    client: Client<OpenAIConfig>,
    config: EmbedderConfig,
}

impl OpenAIEmbedder {
    /// The key comes from the config, then from `OPENAI_API_KEY`.
    pub fn new(config: EmbedderConfig) -> KgResult<Self> {
        let api_key = match config.api_key.clone() {
            Some(key) => key,
            None => std::env::var("OPENAI_API_KEY").map_err(|_| {
                KgError::Configuration(
                    "embedder.provider is openai but no API key is set (embedder.api_key or OPENAI_API_KEY)"
                        .to_string(),
                )
            })?,
        };

        #[cfg(feature = "openai")]
        let client = {
            let mut openai = OpenAIConfig::new().with_api_key(api_key);
            if let Some(base_url) = &config.base_url {
                openai = openai.with_api_base(base_url);
            }
            Client::with_config(openai)
        };
        #[cfg(not(feature = "openai"))]
        drop(api_key);

        Ok(Self {
            #[cfg(feature = "openai")]
            client,
            config,
        })
    }

    /// Only the text-embedding-3 family accepts a requested size.
    fn requested_dimensions(&self) -> Option<u32> {
        self.config
            .model
            .starts_with("text-embedding-3")
            .then_some(self.config.embedding_dims as u32)
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    #[cfg(feature = "openai")]
    async fn embed(&self, text: &str) -> KgResult<Vec<f32>> {
        let request = CreateEmbeddingRequest {
            model: self.config.model.clone(),
            input: EmbeddingInput::String(text.to_string()),
            dimensions: self.requested_dimensions(),
            ..Default::default()
        };

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| KgError::embedding(format!("OpenAI {}: {}", self.config.model, e)))?;

        let vector = response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| KgError::embedding(format!("OpenAI {} returned no vector", self.config.model)))?;

        // Stored vectors share one column width
        if vector.len() != self.config.embedding_dims {
            return Err(KgError::embedding(format!(
                "OpenAI {} returned {} dimensions, expected {}",
                self.config.model,
                vector.len(),
                self.config.embedding_dims
            )));
        }
        Ok(vector)
    }

    #[cfg(not(feature = "openai"))]
    async fn embed(&self, _text: &str) -> KgResult<Vec<f32>> {
        Err(KgError::Configuration(
            "kgmerge-embeddings was built without the 'openai' feature".to_string(),
        ))
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dims
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
