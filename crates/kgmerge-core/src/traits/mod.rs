//! Core traits for kgmerge providers.

mod embedder;
mod graph_store;

pub use embedder::*;
pub use graph_store::*;
