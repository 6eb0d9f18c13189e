//! Embedding capability used to attach vectors to stored entities and relations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KgResult;

/// Turns entity or relation text into a vector.
///
/// Callers treat every error as "no vector"; an empty vector means the
/// provider is disabled.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> KgResult<Vec<f32>>;

    /// Width of the vectors this provider returns.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Model settings shared by all providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub model: String,
    /// Must match the width of the store's embedding column.
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
    /// Falls back to the provider's environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Server URL; each provider has its own default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_embedding_dims() -> usize {
    768
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            model: "nomic-embed-text".to_string(),
            embedding_dims: default_embedding_dims(),
            api_key: None,
            base_url: None,
        }
    }
}

/// Embedder provider type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EmbedderProvider {
    /// No vectors are generated.
    #[default]
    Disabled,
    Ollama,
    OpenAI,
}

/// The `embedder` section of the engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedderProviderConfig {
    pub provider: EmbedderProvider,
    #[serde(flatten)]
    pub config: EmbedderConfig,
}

impl EmbedderProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != EmbedderProvider::Disabled
    }
}
