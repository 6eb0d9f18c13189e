//! Entity store trait and related types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KgResult;
use crate::types::{EntityPayload, RelationUpdate, StoredEntity, StoredRelation};

/// Core EntityStore trait - all graph store backends implement this.
///
/// Absence is `Ok(None)`; errors are reserved for calls that failed. Stores
/// classify their failures into retryable and fatal [`crate::KgError`]
/// variants so the engine can apply its retry policy without parsing messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch an entity by primary key.
    async fn get_entity(&self, entity_type: &str, name: &str) -> KgResult<Option<StoredEntity>>;

    /// Create an entity, upserting on the primary key.
    ///
    /// On conflict, array fields are unioned rather than overwritten.
    async fn create_entity(&self, entity_type: &str, payload: &EntityPayload) -> KgResult<StoredEntity>;

    /// Write only the given fields of an existing entity.
    async fn update_entity(
        &self,
        entity_type: &str,
        name: &str,
        payload: &EntityPayload,
    ) -> KgResult<StoredEntity>;

    /// Find an entity whose `field` equals `value` case-insensitively, or,
    /// with `match_array`, whose array `field` contains it.
    async fn find_entity_by_predicate(
        &self,
        entity_type: &str,
        field: &str,
        value: &str,
        match_array: bool,
    ) -> KgResult<Option<StoredEntity>>;

    /// Fetch a relation by id.
    async fn get_relation(&self, id: &str) -> KgResult<Option<StoredRelation>>;

    /// Create a relation between two existing entities.
    async fn create_relation(&self, relation: &StoredRelation) -> KgResult<StoredRelation>;

    /// Write only the given fields of an existing relation.
    async fn update_relation(&self, id: &str, update: &RelationUpdate) -> KgResult<StoredRelation>;
}

/// Graph store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStoreConfig {
    /// Provider type.
    pub provider: GraphStoreProvider,
    /// Connection URL.
    #[serde(default = "default_store_url")]
    pub url: String,
}

fn default_store_url() -> String {
    "http://localhost:8000".to_string()
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            provider: GraphStoreProvider::Memory,
            url: default_store_url(),
        }
    }
}

/// Graph store provider type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum GraphStoreProvider {
    #[default]
    Memory,
    Kuzu,
}
