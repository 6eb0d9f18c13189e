//! Batch-scoped mapping from extracted names to canonical identities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a group ended up with its canonical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GroupOutcome {
    /// A new stored entity was written.
    Created,
    /// The group was merged into an existing stored entity.
    Merged,
    /// The write failed; the identity is a non-persisted fallback.
    FailedWithFallback,
}

/// Canonical identity of an extracted name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    pub canonical_id: String,
    pub entity_type: String,
    pub outcome: GroupOutcome,
}

/// Extracted name to canonical identity, for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalMap {
    entries: BTreeMap<String, CanonicalEntry>,
}

impl CanonicalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every name to the same canonical identity. Later groups win on conflict.
    pub fn insert_all<'a, I>(&mut self, names: I, canonical_id: &str, entity_type: &str, outcome: GroupOutcome)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            if let Some(previous) = self.entries.get(name) {
                if previous.canonical_id != canonical_id {
                    tracing::debug!(
                        "Remapping {} from {}:{} to {}:{}",
                        name,
                        previous.entity_type,
                        previous.canonical_id,
                        entity_type,
                        canonical_id
                    );
                }
            }
            self.entries.insert(
                name.to_string(),
                CanonicalEntry {
                    canonical_id: canonical_id.to_string(),
                    entity_type: entity_type.to_string(),
                    outcome,
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&CanonicalEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CanonicalEntry)> {
        self.entries.iter()
    }
}
