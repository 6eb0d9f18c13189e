//! kgmerge-graph-stores - Entity store backends for kgmerge.
//!
//! # Supported Backends
//!
//! - **Memory** - the in-process store from `kgmerge-core`, for tests and dry runs
//! - **Kuzu** - a Kuzu API server, queried with Cypher over HTTP

mod factory;
mod kuzu;

pub use factory::GraphStoreFactory;
pub use kuzu::{entity_from_node, relation_from_row, validate_identifier, KuzuStore};

// Re-export core types
pub use kgmerge_core::traits::{EntityStore, GraphStoreConfig, GraphStoreProvider};
