//! Grouping of matching records into connected components.

use std::collections::BTreeMap;

use petgraph::unionfind::UnionFind;

use super::matcher::Matcher;
use crate::types::{EntityGroup, EntityRecord};

/// Turns pairwise match decisions into groups.
#[derive(Debug, Clone)]
pub struct Grouper {
    matcher: Matcher,
}

impl Grouper {
    pub fn new(matcher: Matcher) -> Self {
        Self { matcher }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Group records by type into connected components of the match relation.
    ///
    /// Every unordered pair of same-type records is compared once. Items keep
    /// their batch order inside a group, and groups are ordered by their first
    /// item, so the result depends only on which records match.
    pub fn group(&self, items: &[EntityRecord]) -> Vec<EntityGroup> {
        let mut by_type: BTreeMap<&str, Vec<&EntityRecord>> = BTreeMap::new();
        for item in items {
            by_type.entry(item.entity_type.as_str()).or_default().push(item);
        }

        let mut groups = Vec::new();
        for (entity_type, mut members) in by_type {
            members.sort_by_key(|r| r.batch_id);
            let mut components = UnionFind::<usize>::new(members.len());

            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    let decision = self.matcher.matches(members[i], members[j]);
                    if decision.is_match {
                        tracing::debug!(
                            "Matched {} with {} ({}, {:.2})",
                            members[i].name,
                            members[j].name,
                            decision.reason,
                            decision.confidence
                        );
                        components.union(i, j);
                    }
                }
            }

            let mut by_root: BTreeMap<usize, Vec<EntityRecord>> = BTreeMap::new();
            let mut roots_in_order = Vec::new();
            for (i, member) in members.iter().enumerate() {
                let root = components.find(i);
                let bucket = by_root.entry(root).or_insert_with(|| {
                    roots_in_order.push(root);
                    Vec::new()
                });
                bucket.push((*member).clone());
            }

            for root in roots_in_order {
                if let Some(records) = by_root.remove(&root) {
                    let group_id = format!("group_{}_{}", entity_type, records[0].batch_id);
                    groups.push(EntityGroup::new(group_id, entity_type, records));
                }
            }
        }

        groups.sort_by_key(|g| g.items.first().map(|r| r.batch_id).unwrap_or(usize::MAX));

        let duplicates = groups.iter().filter(|g| g.items.len() > 1).count();
        tracing::debug!(
            "Grouped {} records into {} groups ({} with duplicates)",
            items.len(),
            groups.len(),
            duplicates
        );
        groups
    }
}
