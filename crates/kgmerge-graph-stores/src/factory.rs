//! Factory for creating entity stores.

use std::sync::Arc;

use kgmerge_core::config::EngineConfig;
use kgmerge_core::error::KgResult;
use kgmerge_core::store::MemoryStore;
use kgmerge_core::traits::{EntityStore, GraphStoreProvider};

use crate::kuzu::KuzuStore;

/// Factory for creating entity stores.
pub struct GraphStoreFactory;

impl GraphStoreFactory {
    /// Create the store named by `config.graph_store`.
    pub fn create(config: &EngineConfig) -> KgResult<Arc<dyn EntityStore>> {
        match config.graph_store.provider {
            GraphStoreProvider::Memory => {
                tracing::info!("Using in-memory graph store");
                Ok(Arc::new(MemoryStore::new()))
            }
            GraphStoreProvider::Kuzu => {
                tracing::info!("Using Kuzu graph store at {}", config.graph_store.url);
                let store = KuzuStore::new(&config.graph_store, config.schema.clone(), config.store_timeout())?;
                Ok(Arc::new(store))
            }
        }
    }

    /// Create a Kuzu store for `url` with the configured schema.
    pub fn kuzu(url: &str, config: &EngineConfig) -> KgResult<Arc<dyn EntityStore>> {
        let mut graph_store = config.graph_store.clone();
        graph_store.provider = GraphStoreProvider::Kuzu;
        graph_store.url = url.to_string();
        let store = KuzuStore::new(&graph_store, config.schema.clone(), config.store_timeout())?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgmerge_core::traits::GraphStoreConfig;

    #[tokio::test]
    async fn test_memory_is_default() {
        let store = GraphStoreFactory::create(&EngineConfig::default()).unwrap();
        assert!(store.get_entity("Person", "Ada").await.unwrap().is_none());
    }

    #[test]
    fn test_kuzu_rejects_bad_url() {
        let config = EngineConfig {
            graph_store: GraphStoreConfig {
                provider: GraphStoreProvider::Kuzu,
                url: "::".to_string(),
            },
            ..EngineConfig::default()
        };
        assert!(GraphStoreFactory::create(&config).is_err());
        assert!(GraphStoreFactory::kuzu("http://localhost:7000", &config).is_ok());
    }
}
