//! Canonicalization and consolidation of extracted relations.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::stats::ItemError;
use crate::embedding::EmbeddingService;
use crate::error::{KgError, KgResult};
use crate::retry::StoreCaller;
use crate::traits::EntityStore;
use crate::types::{
    append_unique, CanonicalMap, RelationGroup, RelationKey, RelationRecord, RelationUpdate,
    StoredRelation,
};

/// Counts from one consolidation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidationReport {
    /// Relation records handed in.
    pub received: usize,
    /// Relation groups created or merged into the store.
    pub processed: usize,
    /// Records whose endpoints were not in the canonical map.
    pub skipped_unresolved: usize,
    /// Groups whose endpoint entity definitively does not exist.
    pub skipped_missing_endpoint: usize,
    /// Groups whose write failed.
    pub failed: usize,
    pub errors: Vec<ItemError>,
    /// Processing stopped early on cancellation.
    pub cancelled: bool,
}

impl ConsolidationReport {
    pub fn skipped(&self) -> usize {
        self.skipped_unresolved + self.skipped_missing_endpoint
    }
}

enum Endpoint {
    Exists,
    Missing,
    Unknown,
}

/// Groups relations by canonical triple and merges them into the store.
pub struct RelationConsolidator {
    store: Arc<dyn EntityStore>,
    caller: StoreCaller,
    embeddings: EmbeddingService,
}

impl RelationConsolidator {
    pub fn new(store: Arc<dyn EntityStore>, caller: StoreCaller, embeddings: EmbeddingService) -> Self {
        Self {
            store,
            caller,
            embeddings,
        }
    }

    /// Resolve endpoints through `canonical` and group by `(source, target, type)`.
    ///
    /// Groups keep the order in which their first record appeared. Returns the
    /// groups and the number of records skipped for unresolved endpoints.
    pub fn group(&self, relations: &[RelationRecord], canonical: &CanonicalMap) -> (Vec<RelationGroup>, usize) {
        let mut groups: Vec<RelationGroup> = Vec::new();
        let mut index: HashMap<RelationKey, usize> = HashMap::new();
        let mut skipped = 0;

        for record in relations {
            let (source, target) = match (canonical.get(&record.source_name), canonical.get(&record.target_name)) {
                (Some(source), Some(target)) => (source, target),
                (source, target) => {
                    let mut missing = Vec::new();
                    if source.is_none() {
                        missing.push(format!("source '{}'", record.source_name));
                    }
                    if target.is_none() {
                        missing.push(format!("target '{}'", record.target_name));
                    }
                    tracing::warn!(
                        "Skipping relation {} -> {} ({}): {} not in entity mapping",
                        record.source_name,
                        record.target_name,
                        record.relation_type,
                        missing.join(", ")
                    );
                    skipped += 1;
                    continue;
                }
            };

            let key = RelationKey::new(&source.canonical_id, &target.canonical_id, &record.relation_type);
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                groups.push(RelationGroup::new(key, &source.entity_type, &target.entity_type));
                groups.len() - 1
            });
            groups[slot].absorb(record);
        }

        (groups, skipped)
    }

    /// Merge relations into the store, one group at a time.
    pub async fn consolidate(
        &self,
        relations: &[RelationRecord],
        canonical: &CanonicalMap,
        provenance_id: &str,
        cancel: &CancellationToken,
    ) -> ConsolidationReport {
        let (groups, skipped) = self.group(relations, canonical);
        let mut report = ConsolidationReport {
            received: relations.len(),
            skipped_unresolved: skipped,
            ..ConsolidationReport::default()
        };

        for group in &groups {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let label = format!(
                "{} -> {} ({})",
                group.key.source, group.key.target, group.key.relation_type
            );

            match self.write_group(group, provenance_id, cancel).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped_missing_endpoint += 1,
                Err(KgError::Cancelled { .. }) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    let e = e.in_context(&format!("relation {}", label));
                    tracing::error!("Failed to write relation {}: {}", label, e);
                    report.failed += 1;
                    report.errors.push(ItemError::from_error(label, &e));
                }
            }
        }

        tracing::info!(
            "Processed {} unique relations from {} raw relations ({} skipped, {} failed)",
            report.processed,
            report.received,
            report.skipped(),
            report.failed
        );
        report
    }

    /// Create or merge one group. `Ok(false)` when an endpoint does not exist.
    async fn write_group(
        &self,
        group: &RelationGroup,
        provenance_id: &str,
        cancel: &CancellationToken,
    ) -> KgResult<bool> {
        let id = group.key.relation_id();
        let existing = self
            .caller
            .call("get_relation", cancel, || self.store.get_relation(&id))
            .await?;

        match existing {
            Some(existing) => {
                self.merge_into(group, &existing, provenance_id, cancel).await?;
                Ok(true)
            }
            None => self.create(group, provenance_id, cancel).await,
        }
    }

    async fn merge_into(
        &self,
        group: &RelationGroup,
        existing: &StoredRelation,
        provenance_id: &str,
        cancel: &CancellationToken,
    ) -> KgResult<()> {
        let mut update = RelationUpdate::default();

        let mut descriptions = existing.descriptions.clone();
        if append_unique(&mut descriptions, &group.descriptions) {
            update.descriptions = Some(descriptions.clone());
        }
        let mut tags = existing.tags.clone();
        if append_unique(&mut tags, &group.tags) {
            update.tags = Some(tags.clone());
        }
        let mut permissions = existing.permissions.clone();
        if append_unique(&mut permissions, &group.permissions) {
            update.permissions = Some(permissions);
        }
        let mut sources = existing.sources.clone();
        let added_provenance = append_unique(&mut sources, [provenance_id]);
        if append_unique(&mut sources, &group.sources) || added_provenance {
            update.sources = Some(sources);
        }
        let strength = existing.strength.max(group.strength());
        if strength > existing.strength {
            update.strength = Some(strength);
        }

        if update.is_empty() {
            tracing::debug!("Relation {} unchanged", existing.id);
            return Ok(());
        }
        if update.changes_content() {
            update.embedding = self.embeddings.embed_relation(&tags, &descriptions, strength).await;
        }
        update.last_updated = Some(chrono::Utc::now().to_rfc3339());

        self.caller
            .call("update_relation", cancel, || self.store.update_relation(&existing.id, &update))
            .await?;
        Ok(())
    }

    async fn create(
        &self,
        group: &RelationGroup,
        provenance_id: &str,
        cancel: &CancellationToken,
    ) -> KgResult<bool> {
        for (entity_type, name) in [
            (&group.source_type, &group.key.source),
            (&group.target_type, &group.key.target),
        ] {
            if let Endpoint::Missing = self.endpoint(entity_type, name, cancel).await? {
                tracing::warn!(
                    "Skipping relation {} -> {} ({}): entity {}:{} does not exist",
                    group.key.source,
                    group.key.target,
                    group.key.relation_type,
                    entity_type,
                    name
                );
                return Ok(false);
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        let mut relation = StoredRelation::from_group(group, provenance_id, &now);
        relation.embedding = self
            .embeddings
            .embed_relation(&relation.tags, &relation.descriptions, relation.strength)
            .await;

        self.caller
            .call("create_relation", cancel, || self.store.create_relation(&relation))
            .await?;
        tracing::debug!(
            "Created relation {} -> {} ({}) from {} records",
            group.key.source,
            group.key.target,
            group.key.relation_type,
            group.members
        );
        Ok(true)
    }

    /// Check an endpoint. A failed lookup is `Unknown`, never `Missing`.
    async fn endpoint(&self, entity_type: &str, name: &str, cancel: &CancellationToken) -> KgResult<Endpoint> {
        match self
            .caller
            .call("get_entity", cancel, || self.store.get_entity(entity_type, name))
            .await
        {
            Ok(Some(_)) => Ok(Endpoint::Exists),
            Ok(None) => Ok(Endpoint::Missing),
            Err(e @ KgError::Cancelled { .. }) => Err(e),
            Err(e) => {
                tracing::warn!("Error looking up entity {}:{}: {}", entity_type, name, e);
                Ok(Endpoint::Unknown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::store::MemoryStore;
    use crate::traits::MockEntityStore;
    use crate::types::{GroupOutcome, StoredEntity};
    use std::time::Duration;

    fn caller() -> StoreCaller {
        StoreCaller::new(RetryPolicy::none(), Duration::from_secs(1))
    }

    fn canonical() -> CanonicalMap {
        let mut map = CanonicalMap::new();
        map.insert_all(["Ada", "Ada Lovelace"], "Ada", "Person", GroupOutcome::Created);
        map.insert_all(["Apollo"], "Apollo", "Project", GroupOutcome::Created);
        map
    }

    #[test]
    fn test_group_canonicalizes_endpoints() {
        let consolidator = RelationConsolidator::new(Arc::new(MemoryStore::new()), caller(), EmbeddingService::disabled());
        let relations = vec![
            RelationRecord::new("Ada", "Apollo", "WORKS_ON").with_description("designs"),
            RelationRecord::new("Ada Lovelace", "Apollo", "WORKS_ON").with_description("reviews"),
            RelationRecord::new("Apollo", "Ada", "OWNED_BY"),
            RelationRecord::new("Ada", "Zeus", "KNOWS"),
        ];
        let (groups, skipped) = consolidator.group(&relations, &canonical());
        assert_eq!(skipped, 1);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, RelationKey::new("Ada", "Apollo", "WORKS_ON"));
        assert_eq!(groups[0].descriptions, vec!["designs", "reviews"]);
        assert_eq!(groups[0].source_type, "Person");
        assert_eq!(groups[1].key.source, "Apollo");
    }

    #[tokio::test]
    async fn test_merges_into_existing_relation() {
        let store = Arc::new(MemoryStore::new());
        store.insert_entity(StoredEntity::new("Person", "Ada")).await;
        store.insert_entity(StoredEntity::new("Project", "Apollo")).await;
        let consolidator = RelationConsolidator::new(store.clone(), caller(), EmbeddingService::disabled());

        let first = vec![RelationRecord::new("Ada", "Apollo", "WORKS_ON")
            .with_description("helps with X")
            .with_strength(5.0)];
        let report = consolidator
            .consolidate(&first, &canonical(), "doc:1", &CancellationToken::new())
            .await;
        assert_eq!(report.processed, 1);

        let second = vec![RelationRecord::new("Ada Lovelace", "Apollo", "WORKS_ON")
            .with_description("also reviews Y")
            .with_strength(7.0)
            .with_permissions(vec!["team".to_string()])];
        let report = consolidator
            .consolidate(&second, &canonical(), "doc:2", &CancellationToken::new())
            .await;
        assert_eq!(report.processed, 1);

        let relations = store.relations().await;
        assert_eq!(relations.len(), 1);
        let stored = &relations[0];
        assert_eq!(stored.descriptions, vec!["helps with X", "also reviews Y"]);
        assert_eq!(stored.strength, 7.0);
        assert_eq!(stored.sources, vec!["doc:1", "doc:2"]);
        assert_eq!(stored.permissions, vec!["team"]);
        assert_eq!(stored.tags, vec!["WORKS_ON"]);
    }

    #[tokio::test]
    async fn test_record_sources_are_stored() {
        let store = Arc::new(MemoryStore::new());
        store.insert_entity(StoredEntity::new("Person", "Ada")).await;
        store.insert_entity(StoredEntity::new("Project", "Apollo")).await;
        let consolidator = RelationConsolidator::new(store.clone(), caller(), EmbeddingService::disabled());
        let cancel = CancellationToken::new();

        let first = vec![RelationRecord::new("Ada", "Apollo", "WORKS_ON")
            .with_sources(vec!["mail:9".to_string(), "mail:10".to_string()])];
        consolidator.consolidate(&first, &canonical(), "doc:1", &cancel).await;
        assert_eq!(store.relations().await[0].sources, vec!["doc:1", "mail:9", "mail:10"]);

        // Known provenance plus a new record source still updates
        let second = vec![RelationRecord::new("Ada", "Apollo", "WORKS_ON")
            .with_sources(vec!["mail:10".to_string(), "mail:11".to_string()])];
        let report = consolidator.consolidate(&second, &canonical(), "doc:1", &cancel).await;
        assert_eq!(report.processed, 1);
        assert_eq!(
            store.relations().await[0].sources,
            vec!["doc:1", "mail:9", "mail:10", "mail:11"]
        );
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.insert_entity(StoredEntity::new("Person", "Ada")).await;
        let consolidator = RelationConsolidator::new(store.clone(), caller(), EmbeddingService::disabled());

        let relations = vec![RelationRecord::new("Ada", "Apollo", "WORKS_ON")];
        let report = consolidator
            .consolidate(&relations, &canonical(), "doc:1", &CancellationToken::new())
            .await;
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped_missing_endpoint, 1);
        assert_eq!(store.relation_count().await, 0);
    }

    #[tokio::test]
    async fn test_lookup_error_does_not_drop_relation() {
        let mut store = MockEntityStore::new();
        store.expect_get_relation().returning(|_| Ok(None));
        store
            .expect_get_entity()
            .returning(|_, _| Err(KgError::transient_store("connection reset")));
        store
            .expect_create_relation()
            .times(1)
            .returning(|relation| Ok(relation.clone()));

        let consolidator = RelationConsolidator::new(Arc::new(store), caller(), EmbeddingService::disabled());
        let relations = vec![RelationRecord::new("Ada", "Apollo", "WORKS_ON")];
        let report = consolidator
            .consolidate(&relations, &canonical(), "doc:1", &CancellationToken::new())
            .await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_write_failure_is_recorded() {
        let mut store = MockEntityStore::new();
        store
            .expect_get_relation()
            .returning(|_| Err(KgError::from_http_status(413, "too large")));

        let consolidator = RelationConsolidator::new(Arc::new(store), caller(), EmbeddingService::disabled());
        let relations = vec![RelationRecord::new("Ada", "Apollo", "WORKS_ON")];
        let report = consolidator
            .consolidate(&relations, &canonical(), "doc:1", &CancellationToken::new())
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].code, "STORE_003");
        assert!(!report.errors[0].retryable);
    }
}
