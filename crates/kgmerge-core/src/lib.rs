//! kgmerge-core - Core library for kgmerge.
//!
//! This crate provides the data model, configuration, store and embedder
//! traits, and the merge engine that folds extracted entities and relations
//! into a persistent knowledge graph.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kgmerge_core::{EngineConfig, MemoryStore, MergeEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Arc::new(EngineConfig::from_file("kgmerge.yaml")?);
//! let engine = MergeEngine::new(config, Arc::new(MemoryStore::new()));
//!
//! let report = engine.process_batch(&batch, "mail:42", &CancellationToken::new()).await;
//! println!("{} created, {} merged", report.entities_created, report.entities_merged);
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{EngineConfig, EntitySchema, FieldSpec, MatchRule, MergeStrategy, RetryPolicy};
pub use embedding::{EmbeddingService, NoopEmbedder};
pub use error::{ErrorCode, KgError, KgResult};
pub use merge::{BatchReport, ExtractedBatch, MergeEngine};
pub use pipeline::{parse_input, MergePipeline, PipelineReport};
pub use store::MemoryStore;
pub use traits::{
    Embedder, EmbedderConfig, EmbedderProvider, EntityStore, GraphStoreConfig, GraphStoreProvider,
};
pub use types::{
    AttributeValue, Attributes, CanonicalMap, EntityGroup, EntityRecord, GroupOutcome,
    RelationRecord, StoredEntity, StoredRelation,
};
