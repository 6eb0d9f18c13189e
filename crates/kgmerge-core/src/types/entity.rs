//! Entity records, groups and stored entities.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use super::value::{AttributeValue, Attributes};
use crate::error::{ErrorCode, KgError, KgResult};

/// One extracted mention of an entity, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Position of the record in its input batch.
    pub batch_id: usize,
    /// Entity type tag, e.g. `Person`.
    pub entity_type: String,
    /// Extracted display name.
    pub name: String,
    /// Extracted attributes keyed by extracted field name.
    pub attributes: Attributes,
    /// The record as extracted, kept for diagnostics.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl EntityRecord {
    /// Create a record with no attributes.
    pub fn new(batch_id: usize, entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            batch_id,
            entity_type: entity_type.into(),
            name: name.into(),
            attributes: Attributes::new(),
            raw: serde_json::Value::Null,
        }
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }

    /// Parse an extractor output object.
    ///
    /// Accepts `entity_type`/`type` and `entity_name`/`name`; both must be non-empty.
    pub fn from_extracted(batch_id: usize, value: &serde_json::Value) -> KgResult<Self> {
        let entity_type = first_str(value, &["entity_type", "type"])
            .ok_or_else(|| KgError::missing_field("entity_type", ErrorCode::ValMissingType))?;
        let name = first_str(value, &["entity_name", "name"])
            .ok_or_else(|| KgError::missing_field("entity_name", ErrorCode::ValMissingName))?;

        let mut attributes = Attributes::new();
        if let Some(obj) = value.get("attributes").and_then(|a| a.as_object()) {
            for (field, raw) in obj {
                if let Some(v) = AttributeValue::from_json(raw) {
                    attributes.insert(field.clone(), v);
                }
            }
        }
        // Flat records carry attributes next to the type and name
        if let Some(obj) = value.as_object() {
            for (field, raw) in obj {
                if RESERVED_KEYS.contains(&field.as_str()) || attributes.contains_key(field) {
                    continue;
                }
                if let Some(v) = AttributeValue::from_json(raw) {
                    attributes.insert(field.clone(), v);
                }
            }
        }

        Ok(Self {
            batch_id,
            entity_type,
            name,
            attributes,
            raw: value.clone(),
        })
    }

    /// Look up a field. `name` falls back to the record's display name.
    pub fn field(&self, field: &str) -> Option<Cow<'_, AttributeValue>> {
        match self.attributes.get(field) {
            Some(v) => Some(Cow::Borrowed(v)),
            None if field == "name" => Some(Cow::Owned(AttributeValue::Text(self.name.clone()))),
            None => None,
        }
    }
}

const RESERVED_KEYS: &[&str] = &["entity_type", "type", "entity_name", "name", "attributes"];

fn first_str(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

/// A stored entity as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub entity_type: String,
    /// Primary key.
    pub name: String,
    /// Stored attributes, excluding the primary key and embedding.
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl StoredEntity {
    pub fn new(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: name.into(),
            attributes: Attributes::new(),
            embedding: None,
        }
    }

    pub fn with_attribute(mut self, field: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }

    /// List value of a field, empty when absent.
    pub fn list(&self, field: &str) -> Vec<String> {
        self.attributes
            .get(field)
            .map(AttributeValue::to_list)
            .unwrap_or_default()
    }
}

/// Field values to write. For creates it must contain `name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl EntityPayload {
    /// Primary key carried by a create payload.
    pub fn name(&self) -> Option<&str> {
        match self.attributes.get("name") {
            Some(AttributeValue::Text(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.embedding.is_none()
    }
}

/// Records believed to denote the same entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityGroup {
    pub group_id: String,
    pub entity_type: String,
    /// Members in batch order; the first is the representative.
    pub items: Vec<EntityRecord>,
    /// Primary key of the stored entity this group reconciles to.
    pub existing_id: Option<String>,
    /// Stored state observed during reconciliation.
    pub existing_snapshot: Option<StoredEntity>,
}

impl EntityGroup {
    pub fn new(group_id: impl Into<String>, entity_type: impl Into<String>, items: Vec<EntityRecord>) -> Self {
        Self {
            group_id: group_id.into(),
            entity_type: entity_type.into(),
            items,
            existing_id: None,
            existing_snapshot: None,
        }
    }

    /// The representative record.
    pub fn representative(&self) -> Option<&EntityRecord> {
        self.items.first()
    }

    /// Attach the stored entity found by reconciliation.
    pub fn reconcile_to(&mut self, existing: StoredEntity) {
        self.existing_id = Some(existing.name.clone());
        self.existing_snapshot = Some(existing);
    }

    /// Distinct extracted names in item order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(self.items.len());
        for item in &self.items {
            if !names.contains(&item.name.as_str()) {
                names.push(&item.name);
            }
        }
        names
    }
}
