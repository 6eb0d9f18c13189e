//! Best-effort embedding of entities and relations.
//!
//! Embedding never fails a write: provider errors and timeouts are logged and
//! the write proceeds without a vector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::KgResult;
use crate::traits::Embedder;
use crate::types::{AttributeValue, Attributes};

const KEY_ATTRIBUTES: [(&str, &str); 4] = [
    ("title", "Title"),
    ("email", "Email"),
    ("organization", "Organization"),
    ("role", "Role"),
];

/// Embedder that produces no vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEmbedder;

#[async_trait]
impl Embedder for NoopEmbedder {
    async fn embed(&self, _text: &str) -> KgResult<Vec<f32>> {
        Ok(Vec::new())
    }

    fn dimension(&self) -> usize {
        0
    }

    fn model_name(&self) -> &str {
        "disabled"
    }
}

/// Text representation of an entity for embedding.
pub fn entity_text(entity_type: &str, name: &str, attributes: &Attributes) -> String {
    let mut parts = vec![entity_type.to_string(), format!("Name: {}", name)];

    if let Some(descriptions) = attributes.get("rawDescriptions") {
        let first: Vec<String> = descriptions.to_list().into_iter().take(3).collect();
        if !first.is_empty() {
            parts.push(format!("Description: {}", first.join(" ")));
        }
    }

    for (field, label) in KEY_ATTRIBUTES {
        if let Some(value) = attributes.get(field).filter(|v| !v.is_empty()) {
            parts.push(format!("{}: {}", label, render(value)));
        }
    }

    parts.join(". ")
}

/// Text representation of a relation for embedding.
pub fn relation_text(tags: &[String], descriptions: &[String], strength: Option<f64>) -> String {
    let mut parts = Vec::new();
    if !tags.is_empty() {
        parts.push(format!("Relation: {}", tags.join(", ")));
    }
    if !descriptions.is_empty() {
        parts.push(format!("Description: {}", descriptions.join(" ")));
    }
    if let Some(strength) = strength {
        parts.push(format!("Strength: {}", strength));
    }
    if parts.is_empty() {
        "Generic relation".to_string()
    } else {
        parts.join(". ")
    }
}

fn render(value: &AttributeValue) -> String {
    match value {
        AttributeValue::List(items) => items.join(", "),
        other => other.as_text().unwrap_or_default(),
    }
}

/// Embedder handle shared by the merge components.
#[derive(Clone)]
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>, timeout: Duration) -> Self {
        Self { embedder, timeout }
    }

    /// Service that never produces vectors.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopEmbedder), Duration::from_secs(1))
    }

    /// Embed `text`; `None` on empty output, error or timeout.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match tokio::time::timeout(self.timeout, self.embedder.embed(text)).await {
            Ok(Ok(vector)) if !vector.is_empty() => Some(vector),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                tracing::warn!("Embedding with {} failed: {}", self.embedder.model_name(), e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "Embedding with {} timed out after {:?}",
                    self.embedder.model_name(),
                    self.timeout
                );
                None
            }
        }
    }

    pub async fn embed_entity(&self, entity_type: &str, name: &str, attributes: &Attributes) -> Option<Vec<f32>> {
        self.embed(&entity_text(entity_type, name, attributes)).await
    }

    pub async fn embed_relation(&self, tags: &[String], descriptions: &[String], strength: f64) -> Option<Vec<f32>> {
        self.embed(&relation_text(tags, descriptions, Some(strength))).await
    }
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("model", &self.embedder.model_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
