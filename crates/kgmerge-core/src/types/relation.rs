//! Relation records, relation groups and stored relations.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::value::append_unique;
use crate::error::{ErrorCode, KgError, KgResult};

/// Default strength for relations that do not carry one.
pub const DEFAULT_STRENGTH: f64 = 1.0;

/// One extracted relationship between two named entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub source_name: String,
    pub target_name: String,
    pub relation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub strength: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl RelationRecord {
    pub fn new(
        source_name: impl Into<String>,
        target_name: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            target_name: target_name.into(),
            relation_type: relation_type.into(),
            description: None,
            strength: DEFAULT_STRENGTH,
            tags: Vec::new(),
            permissions: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    /// Parse an extractor output object.
    pub fn from_extracted(value: &serde_json::Value) -> KgResult<Self> {
        let source = str_field(value, &["source_entity", "source"])
            .ok_or_else(|| KgError::missing_field("source_entity", ErrorCode::ValMissingName))?;
        let target = str_field(value, &["target_entity", "target"])
            .ok_or_else(|| KgError::missing_field("target_entity", ErrorCode::ValMissingName))?;
        let relation_type = str_field(value, &["relationship_type", "type"])
            .ok_or_else(|| KgError::missing_field("relationship_type", ErrorCode::ValMissingType))?;

        let strength = match value.get("strength") {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
        .unwrap_or(DEFAULT_STRENGTH);

        Ok(Self {
            source_name: source,
            target_name: target,
            relation_type,
            description: str_field(value, &["description"]),
            strength,
            tags: list_field(value, &["tags", "relationTag"]),
            permissions: list_field(value, &["permissions"]),
            sources: list_field(value, &["sources"]),
        })
    }
}

fn str_field(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

fn list_field(value: &serde_json::Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        match value.get(*key) {
            Some(serde_json::Value::Array(items)) => {
                return items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter(|s| !s.trim().is_empty())
                    .map(String::from)
                    .collect();
            }
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => return vec![s.clone()],
            _ => {}
        }
    }
    Vec::new()
}

/// Canonical `(source, target, type)` triple. Direction is kept as extracted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationKey {
    pub source: String,
    pub target: String,
    pub relation_type: String,
}

impl RelationKey {
    pub fn new(source: impl Into<String>, target: impl Into<String>, relation_type: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relation_type: relation_type.into(),
        }
    }

    /// Content-addressed id of the stored relation.
    pub fn relation_id(&self) -> String {
        relation_id(&self.source, &self.relation_type, &self.target)
    }
}

/// SHA-256 over `"{source}::{relation_type}::{target}"`, hex encoded.
pub fn relation_id(source: &str, relation_type: &str, target: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}::{}::{}", source, relation_type, target).as_bytes());
    hex::encode(hasher.finalize())
}

/// Relation records sharing one canonical key, merged.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationGroup {
    pub key: RelationKey,
    pub source_type: String,
    pub target_type: String,
    pub descriptions: Vec<String>,
    pub tags: Vec<String>,
    pub permissions: Vec<String>,
    pub sources: Vec<String>,
    pub strength: f64,
    pub members: usize,
}

impl RelationGroup {
    pub fn new(key: RelationKey, source_type: impl Into<String>, target_type: impl Into<String>) -> Self {
        let tags = vec![key.relation_type.clone()];
        Self {
            key,
            source_type: source_type.into(),
            target_type: target_type.into(),
            descriptions: Vec::new(),
            tags,
            permissions: Vec::new(),
            sources: Vec::new(),
            strength: f64::MIN,
            members: 0,
        }
    }

    /// Fold one record into the group.
    pub fn absorb(&mut self, record: &RelationRecord) {
        if let Some(description) = &record.description {
            append_unique(&mut self.descriptions, [description]);
        }
        append_unique(&mut self.tags, &record.tags);
        append_unique(&mut self.permissions, &record.permissions);
        append_unique(&mut self.sources, &record.sources);
        self.strength = self.strength.max(record.strength);
        self.members += 1;
    }

    /// Group strength, defaulting when no member carried one.
    pub fn strength(&self) -> f64 {
        if self.members == 0 {
            DEFAULT_STRENGTH
        } else {
            self.strength
        }
    }
}

/// A stored relation as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRelation {
    pub id: String,
    pub source: String,
    pub source_type: String,
    pub target: String,
    pub target_type: String,
    pub relation_type: String,
    #[serde(default)]
    pub descriptions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub strength: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl StoredRelation {
    /// Build a new stored relation from a merged group.
    pub fn from_group(group: &RelationGroup, provenance_id: &str, now: &str) -> Self {
        let mut sources = vec![provenance_id.to_string()];
        append_unique(&mut sources, &group.sources);
        Self {
            id: group.key.relation_id(),
            source: group.key.source.clone(),
            source_type: group.source_type.clone(),
            target: group.key.target.clone(),
            target_type: group.target_type.clone(),
            relation_type: group.key.relation_type.clone(),
            descriptions: group.descriptions.clone(),
            tags: group.tags.clone(),
            permissions: group.permissions.clone(),
            sources,
            strength: group.strength(),
            created_at: Some(now.to_string()),
            last_updated: Some(now.to_string()),
            embedding: None,
        }
    }
}

/// Field updates for an existing relation. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl RelationUpdate {
    /// Whether the update changes anything the embedding is computed from.
    pub fn changes_content(&self) -> bool {
        self.descriptions.is_some() || self.tags.is_some() || self.strength.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_none()
            && self.tags.is_none()
            && self.permissions.is_none()
            && self.sources.is_none()
            && self.strength.is_none()
            && self.embedding.is_none()
    }

    /// Apply the update to a stored relation in place.
    pub fn apply_to(&self, relation: &mut StoredRelation) {
        if let Some(v) = &self.descriptions {
            relation.descriptions = v.clone();
        }
        if let Some(v) = &self.tags {
            relation.tags = v.clone();
        }
        if let Some(v) = &self.permissions {
            relation.permissions = v.clone();
        }
        if let Some(v) = &self.sources {
            relation.sources = v.clone();
        }
        if let Some(v) = self.strength {
            relation.strength = v;
        }
        if let Some(v) = &self.embedding {
            relation.embedding = Some(v.clone());
        }
        if let Some(v) = &self.last_updated {
            relation.last_updated = Some(v.clone());
        }
    }
}
