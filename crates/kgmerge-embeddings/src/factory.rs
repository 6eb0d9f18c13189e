//! Factory for creating embedding providers.

use std::sync::Arc;

use kgmerge_core::embedding::NoopEmbedder;
use kgmerge_core::error::KgResult;
use kgmerge_core::traits::{Embedder, EmbedderConfig, EmbedderProvider, EmbedderProviderConfig};

use crate::ollama::OllamaEmbedder;
use crate::openai::OpenAIEmbedder;

/// Factory for creating embedding providers.
pub struct EmbedderFactory;

impl EmbedderFactory {
    /// Create an embedder from the given configuration.
    pub fn create(provider: EmbedderProvider, config: EmbedderConfig) -> KgResult<Arc<dyn Embedder>> {
        match provider {
            EmbedderProvider::Disabled => Ok(Arc::new(NoopEmbedder)),
            EmbedderProvider::OpenAI => {
                let embedder = OpenAIEmbedder::new(config)?;
                Ok(Arc::new(embedder))
            }
            EmbedderProvider::Ollama => {
                let embedder = OllamaEmbedder::new(config)?;
                Ok(Arc::new(embedder))
            }
        }
    }

    /// Create the embedder named by the `embedder` config section.
    pub fn from_config(config: &EmbedderProviderConfig) -> KgResult<Arc<dyn Embedder>> {
        if config.is_enabled() {
            tracing::info!("Using {} embedder ({})", config.provider, config.config.model);
        } else {
            tracing::info!("Embeddings disabled, entities are stored without vectors");
        }
        Self::create(config.provider, config.config.clone())
    }

    /// Create an Ollama embedder with a specific model.
    pub fn ollama_with_model(model: impl Into<String>, dims: usize) -> KgResult<Arc<dyn Embedder>> {
        let config = EmbedderConfig {
            model: model.into(),
            embedding_dims: dims,
            ..Default::default()
        };
        Self::create(EmbedderProvider::Ollama, config)
    }
}
