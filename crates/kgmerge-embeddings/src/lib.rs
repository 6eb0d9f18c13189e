//! kgmerge-embeddings - Embedding provider implementations for kgmerge.
//!
//! Vectors are attached to stored entities and relations on a best-effort
//! basis; the engine never fails a write because embedding failed.
//!
//! # Supported Providers
//!
//! - **Ollama** - local models such as `nomic-embed-text` via `POST /api/embeddings`
//! - **OpenAI** (feature: `openai`) - text-embedding-3-small, text-embedding-3-large, etc.
//!
//! # Example
//!
//! ```ignore
//! use kgmerge_embeddings::EmbedderFactory;
//!
//! let embedder = EmbedderFactory::ollama_with_model("nomic-embed-text", 768)?;
//! let vector = embedder.embed("Person. Name: Ada Lovelace").await?;
//! ```

mod factory;
mod ollama;
mod openai;

pub use factory::EmbedderFactory;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAIEmbedder;

// Re-export core types for convenience
pub use kgmerge_core::traits::{Embedder, EmbedderConfig, EmbedderProvider, EmbedderProviderConfig};
