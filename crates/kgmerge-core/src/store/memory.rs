//! In-memory entity store.
//!
//! Backs tests and dry runs. Maps are ordered so that iteration, and with it
//! predicate lookups, are deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ErrorCode, KgError, KgResult};
use crate::traits::EntityStore;
use crate::types::{
    append_unique, normalize, AttributeValue, Attributes, EntityPayload, RelationUpdate,
    StoredEntity, StoredRelation,
};

type EntityKey = (String, String);

/// In-memory [`EntityStore`].
#[derive(Default, Clone)]
pub struct MemoryStore {
    entities: Arc<RwLock<BTreeMap<EntityKey, StoredEntity>>>,
    relations: Arc<RwLock<BTreeMap<String, StoredRelation>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity directly, bypassing merge semantics.
    pub async fn insert_entity(&self, entity: StoredEntity) {
        let key = (entity.entity_type.clone(), entity.name.clone());
        self.entities.write().await.insert(key, entity);
    }

    /// All entities of one type, in primary-key order.
    pub async fn entities(&self, entity_type: &str) -> Vec<StoredEntity> {
        self.entities
            .read()
            .await
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect()
    }

    pub async fn entity_count(&self) -> usize {
        self.entities.read().await.len()
    }

    /// All relations, in id order.
    pub async fn relations(&self) -> Vec<StoredRelation> {
        self.relations.read().await.values().cloned().collect()
    }

    pub async fn relation_count(&self) -> usize {
        self.relations.read().await.len()
    }
}

fn not_found(what: String) -> KgError {
    KgError::NotFound {
        message: what,
        code: ErrorCode::StoreNotFound,
    }
}

/// Upsert `incoming` into `stored`, unioning lists and overwriting scalars.
fn upsert_attributes(stored: &mut Attributes, incoming: &Attributes) {
    for (field, value) in incoming {
        match (stored.get_mut(field), value) {
            (Some(AttributeValue::List(existing)), AttributeValue::List(new)) => {
                append_unique(existing, new);
            }
            _ => {
                stored.insert(field.clone(), value.clone());
            }
        }
    }
}

fn matches_predicate(entity: &StoredEntity, field: &str, value: &str, match_array: bool) -> bool {
    let wanted = normalize(value);
    if field == "name" && !match_array {
        return normalize(&entity.name) == wanted;
    }
    match entity.attributes.get(field) {
        Some(AttributeValue::List(items)) if match_array => {
            items.iter().any(|item| normalize(item) == wanted)
        }
        Some(AttributeValue::Text(text)) if !match_array => normalize(text) == wanted,
        _ => false,
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_entity(&self, entity_type: &str, name: &str) -> KgResult<Option<StoredEntity>> {
        let key = (entity_type.to_string(), name.to_string());
        Ok(self.entities.read().await.get(&key).cloned())
    }

    async fn create_entity(&self, entity_type: &str, payload: &EntityPayload) -> KgResult<StoredEntity> {
        let name = payload
            .name()
            .ok_or_else(|| KgError::schema_violation(format!("{} create without a name", entity_type)))?
            .to_string();

        let mut attributes = payload.attributes.clone();
        attributes.remove("name");

        let mut entities = self.entities.write().await;
        let key = (entity_type.to_string(), name.clone());
        let entity = entities
            .entry(key)
            .or_insert_with(|| StoredEntity::new(entity_type, name));
        upsert_attributes(&mut entity.attributes, &attributes);
        if payload.embedding.is_some() {
            entity.embedding = payload.embedding.clone();
        }
        Ok(entity.clone())
    }

    async fn update_entity(
        &self,
        entity_type: &str,
        name: &str,
        payload: &EntityPayload,
    ) -> KgResult<StoredEntity> {
        let mut entities = self.entities.write().await;
        let key = (entity_type.to_string(), name.to_string());
        let entity = entities
            .get_mut(&key)
            .ok_or_else(|| not_found(format!("{}:{}", entity_type, name)))?;
        for (field, value) in &payload.attributes {
            if field != "name" {
                entity.attributes.insert(field.clone(), value.clone());
            }
        }
        if payload.embedding.is_some() {
            entity.embedding = payload.embedding.clone();
        }
        Ok(entity.clone())
    }

    async fn find_entity_by_predicate(
        &self,
        entity_type: &str,
        field: &str,
        value: &str,
        match_array: bool,
    ) -> KgResult<Option<StoredEntity>> {
        Ok(self
            .entities
            .read()
            .await
            .values()
            .filter(|e| e.entity_type == entity_type)
            .find(|e| matches_predicate(e, field, value, match_array))
            .cloned())
    }

    async fn get_relation(&self, id: &str) -> KgResult<Option<StoredRelation>> {
        Ok(self.relations.read().await.get(id).cloned())
    }

    async fn create_relation(&self, relation: &StoredRelation) -> KgResult<StoredRelation> {
        {
            let entities = self.entities.read().await;
            for (entity_type, name) in [
                (&relation.source_type, &relation.source),
                (&relation.target_type, &relation.target),
            ] {
                if !entities.contains_key(&(entity_type.clone(), name.clone())) {
                    return Err(KgError::schema_violation(format!(
                        "relation {} references missing entity {}:{}",
                        relation.id, entity_type, name
                    )));
                }
            }
        }
        self.relations
            .write()
            .await
            .insert(relation.id.clone(), relation.clone());
        Ok(relation.clone())
    }

    async fn update_relation(&self, id: &str, update: &RelationUpdate) -> KgResult<StoredRelation> {
        let mut relations = self.relations.write().await;
        let relation = relations
            .get_mut(id)
            .ok_or_else(|| not_found(format!("relation {}", id)))?;
        update.apply_to(relation);
        Ok(relation.clone())
    }
}
