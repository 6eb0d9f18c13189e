//! Field mapping and attribute merging for entity groups.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, MergeStrategy};
use crate::embedding::EmbeddingService;
use crate::error::{KgError, KgResult};
use crate::retry::StoreCaller;
use crate::traits::EntityStore;
use crate::types::{append_unique, normalize, AttributeValue, Attributes, EntityGroup, EntityPayload, EntityRecord};

const ALIASES: &str = "aliases";
const SOURCES: &str = "sources";

/// Who is writing. `agent_only` fields accept only agent writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteOrigin {
    #[default]
    Extraction,
    Agent,
}

/// Result of merging one group.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Primary key of the stored entity.
    pub canonical_id: String,
    /// Whether a new entity was written rather than an existing one updated.
    pub created: bool,
    /// Storage fields written.
    pub changed_fields: Vec<String>,
}

/// Maps extracted fields to storage fields and merges groups into the store.
pub struct AttributeMerger {
    config: Arc<EngineConfig>,
    store: Arc<dyn EntityStore>,
    caller: StoreCaller,
    embeddings: EmbeddingService,
}

impl AttributeMerger {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn EntityStore>,
        caller: StoreCaller,
        embeddings: EmbeddingService,
    ) -> Self {
        Self {
            config,
            store,
            caller,
            embeddings,
        }
    }

    /// Translate a record's extracted attributes into storage fields.
    ///
    /// Empty values are dropped. Array fields and descriptions are always lists;
    /// several extracted fields feeding one array field are unioned.
    pub fn map_attributes(&self, record: &EntityRecord) -> Attributes {
        let entity_type = record.entity_type.as_str();
        let mut mapped = Attributes::new();

        for (field, value) in &record.attributes {
            if field == "name" || value.is_empty() {
                continue;
            }
            let target = self.config.target_field(entity_type, field).into_owned();
            let as_list = field == "description" || self.config.is_array_field(entity_type, &target);

            let value = if as_list {
                AttributeValue::List(value.to_list())
            } else {
                value.clone()
            };

            match (mapped.get_mut(&target), &value) {
                (Some(AttributeValue::List(existing)), AttributeValue::List(new)) => {
                    append_unique(existing, new);
                }
                _ => {
                    mapped.insert(target.clone(), value);
                }
            }
            tracing::debug!("Mapped {}.{} -> {}", entity_type, field, target);
        }
        mapped
    }

    /// Merge a group as an extraction write.
    pub async fn merge_group(
        &self,
        group: &EntityGroup,
        provenance_id: &str,
        cancel: &CancellationToken,
    ) -> KgResult<MergeOutcome> {
        self.merge_group_as(group, provenance_id, WriteOrigin::Extraction, cancel)
            .await
    }

    /// Create or update the stored entity for a group.
    pub async fn merge_group_as(
        &self,
        group: &EntityGroup,
        provenance_id: &str,
        origin: WriteOrigin,
        cancel: &CancellationToken,
    ) -> KgResult<MergeOutcome> {
        if group.items.is_empty() {
            return Err(KgError::validation(format!("group {} has no items", group.group_id)));
        }

        match &group.existing_id {
            Some(existing_id) => {
                let snapshot = match &group.existing_snapshot {
                    Some(snapshot) => Some(snapshot.clone()),
                    None => {
                        self.caller
                            .call("get_entity", cancel, || {
                                self.store.get_entity(&group.entity_type, existing_id)
                            })
                            .await?
                    }
                };
                match snapshot {
                    Some(snapshot) => {
                        self.update_existing(group, &snapshot.name, &snapshot.attributes, provenance_id, origin, cancel)
                            .await
                    }
                    None => {
                        tracing::warn!(
                            "Entity {}:{} vanished before merge, creating it",
                            group.entity_type,
                            existing_id
                        );
                        self.create_new(group, provenance_id, origin, cancel).await
                    }
                }
            }
            None => self.create_new(group, provenance_id, origin, cancel).await,
        }
    }

    /// Fold every item's mapped attributes into `working` under each field's strategy.
    fn fold_items(&self, group: &EntityGroup, working: &mut Attributes, origin: WriteOrigin) {
        for item in &group.items {
            for (field, value) in self.map_attributes(item) {
                let strategy = self.config.strategy_for(&group.entity_type, &field);
                if let Some(merged) = merge_value(strategy, working.get(&field), value, origin) {
                    working.insert(field, merged);
                }
            }
        }
    }

    fn records_sources(&self, entity_type: &str) -> bool {
        self.config
            .schema_for(entity_type)
            .map_or(true, |schema| schema.has_field(SOURCES))
    }

    async fn create_new(
        &self,
        group: &EntityGroup,
        provenance_id: &str,
        origin: WriteOrigin,
        cancel: &CancellationToken,
    ) -> KgResult<MergeOutcome> {
        let entity_type = group.entity_type.as_str();
        let primary = group.items[0].name.clone();

        let mut attributes = Attributes::new();
        self.fold_items(group, &mut attributes, origin);

        let mut aliases = list_of(&attributes, ALIASES);
        aliases.retain(|a| normalize(a) != normalize(&primary));
        append_aliases(&mut aliases, group.items.iter().skip(1).map(|r| r.name.as_str()), &primary);
        attributes.insert(ALIASES.to_string(), AttributeValue::List(aliases));

        if self.records_sources(entity_type) {
            let mut sources = list_of(&attributes, SOURCES);
            append_unique(&mut sources, [provenance_id]);
            attributes.insert(SOURCES.to_string(), AttributeValue::List(sources));
        }

        tracing::debug!(
            "Creating {} {} from {} items",
            entity_type,
            primary,
            group.items.len()
        );

        let embedding = self.embeddings.embed_entity(entity_type, &primary, &attributes).await;
        let mut changed_fields: Vec<String> = attributes.keys().cloned().collect();
        changed_fields.insert(0, "name".to_string());
        attributes.insert("name".to_string(), AttributeValue::Text(primary.clone()));

        let payload = EntityPayload {
            attributes,
            embedding,
        };
        let stored = self
            .caller
            .call("create_entity", cancel, || self.store.create_entity(entity_type, &payload))
            .await?;

        Ok(MergeOutcome {
            canonical_id: stored.name,
            created: true,
            changed_fields,
        })
    }

    async fn update_existing(
        &self,
        group: &EntityGroup,
        existing_name: &str,
        existing: &Attributes,
        provenance_id: &str,
        origin: WriteOrigin,
        cancel: &CancellationToken,
    ) -> KgResult<MergeOutcome> {
        let entity_type = group.entity_type.as_str();
        let mut working = existing.clone();
        self.fold_items(group, &mut working, origin);

        let mut aliases = list_of(&working, ALIASES);
        let added = append_aliases(&mut aliases, group.items.iter().map(|r| r.name.as_str()), existing_name);
        if added || working.contains_key(ALIASES) {
            working.insert(ALIASES.to_string(), AttributeValue::List(aliases));
        }

        if self.records_sources(entity_type) {
            let mut sources = list_of(&working, SOURCES);
            append_unique(&mut sources, [provenance_id]);
            working.insert(SOURCES.to_string(), AttributeValue::List(sources));
        }

        let mut changes = Attributes::new();
        for (field, value) in &working {
            if field != "name" && existing.get(field) != Some(value) {
                changes.insert(field.clone(), value.clone());
            }
        }

        let changed_fields: Vec<String> = changes.keys().cloned().collect();
        if changes.is_empty() {
            tracing::debug!("{} {} unchanged, skipping update", entity_type, existing_name);
            return Ok(MergeOutcome {
                canonical_id: existing_name.to_string(),
                created: false,
                changed_fields,
            });
        }

        let embedding = if changed_fields.iter().any(|f| self.config.is_content_field(f)) {
            self.embeddings.embed_entity(entity_type, existing_name, &working).await
        } else {
            None
        };

        let payload = EntityPayload {
            attributes: changes,
            embedding,
        };
        self.caller
            .call("update_entity", cancel, || {
                self.store.update_entity(entity_type, existing_name, &payload)
            })
            .await?;

        Ok(MergeOutcome {
            canonical_id: existing_name.to_string(),
            created: false,
            changed_fields,
        })
    }
}

/// Append names that differ from `primary` and every known alias once
/// trimmed and lowercased.
fn append_aliases<'a>(aliases: &mut Vec<String>, names: impl IntoIterator<Item = &'a str>, primary: &str) -> bool {
    let mut seen: Vec<String> = aliases.iter().map(|a| normalize(a)).collect();
    seen.push(normalize(primary));
    let mut added = false;
    for name in names {
        let key = normalize(name);
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        aliases.push(name.trim().to_string());
        added = true;
    }
    added
}

fn list_of(attributes: &Attributes, field: &str) -> Vec<String> {
    attributes
        .get(field)
        .map(AttributeValue::to_list)
        .unwrap_or_default()
}

/// Size used by `replace_if_better`: characters for text, elements for lists.
fn richness(value: &AttributeValue) -> usize {
    match value {
        AttributeValue::Text(s) => s.trim().chars().count(),
        AttributeValue::List(items) => items.len(),
        AttributeValue::Number(_) => 0,
    }
}

/// Resolve one field. `None` keeps the current value.
pub(crate) fn merge_value(
    strategy: MergeStrategy,
    current: Option<&AttributeValue>,
    incoming: AttributeValue,
    origin: WriteOrigin,
) -> Option<AttributeValue> {
    let current = current.filter(|v| !v.is_empty());
    match strategy {
        MergeStrategy::AgentOnly if origin != WriteOrigin::Agent => None,
        MergeStrategy::AgentOnly | MergeStrategy::ReplaceAlways => Some(incoming),
        MergeStrategy::PreserveExisting => match current {
            Some(_) => None,
            None => Some(incoming),
        },
        MergeStrategy::AppendUnique => {
            let mut merged = current.map(AttributeValue::to_list).unwrap_or_default();
            append_unique(&mut merged, incoming.to_list());
            Some(AttributeValue::List(merged))
        }
        MergeStrategy::ReplaceIfBetter => match current {
            None => Some(incoming),
            Some(AttributeValue::Number(_)) => None,
            Some(_) if matches!(incoming, AttributeValue::Number(_)) => None,
            Some(existing) if richness(&incoming) > richness(existing) => Some(incoming),
            Some(_) => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntitySchema, FieldSpec, RetryPolicy};
    use crate::store::MemoryStore;
    use crate::traits::{Embedder, MockEntityStore};
    use crate::types::StoredEntity;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, _text: &str) -> KgResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.5; 4])
        }

        fn dimension(&self) -> usize {
            4
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    fn config() -> Arc<EngineConfig> {
        Arc::new(
            EngineConfig::builder()
                .schema(
                    "Person",
                    EntitySchema::new()
                        .with_field("name", "STRING")
                        .with_field("aliases", "STRING[]")
                        .with_field("emails", "STRING[]")
                        .with_field("rawDescriptions", "STRING[]")
                        .with_field("sources", "STRING[]")
                        .with_field("title", "STRING")
                        .with_field("location", "STRING")
                        .with_field("status", "STRING"),
                )
                .field("Person", "rawDescriptions", FieldSpec::mapped_from("description"))
                .field("Person", "emails", FieldSpec::mapped_from("email"))
                .field(
                    "Person",
                    "location",
                    FieldSpec::default().with_strategy(MergeStrategy::PreserveExisting),
                )
                .field(
                    "Person",
                    "status",
                    FieldSpec::default().with_strategy(MergeStrategy::AgentOnly),
                )
                .build()
                .unwrap(),
        )
    }

    fn caller() -> StoreCaller {
        StoreCaller::new(RetryPolicy::none(), Duration::from_secs(1))
    }

    fn merger(store: Arc<dyn EntityStore>) -> AttributeMerger {
        AttributeMerger::new(config(), store, caller(), EmbeddingService::disabled())
    }

    #[test]
    fn test_map_attributes() {
        let merger = merger(Arc::new(MemoryStore::new()));
        let record = EntityRecord::new(0, "Person", "Ada")
            .with_attribute("description", "Mathematician")
            .with_attribute("email", "ada@x.com")
            .with_attribute("emails", vec!["ada@y.org"])
            .with_attribute("title", "")
            .with_attribute("phone", "555");
        let mapped = merger.map_attributes(&record);

        assert_eq!(
            mapped.get("rawDescriptions"),
            Some(&AttributeValue::from(vec!["Mathematician"]))
        );
        assert_eq!(
            mapped.get("emails"),
            Some(&AttributeValue::from(vec!["ada@x.com", "ada@y.org"]))
        );
        assert!(!mapped.contains_key("title"));
        assert_eq!(mapped.get("phone"), Some(&AttributeValue::from("555")));
    }

    #[test]
    fn test_merge_value_strategies() {
        let text = |s: &str| AttributeValue::from(s);
        let origin = WriteOrigin::Extraction;

        assert_eq!(
            merge_value(MergeStrategy::PreserveExisting, Some(&text("Paris")), text("London"), origin),
            None
        );
        assert_eq!(
            merge_value(MergeStrategy::PreserveExisting, Some(&text("")), text("London"), origin),
            Some(text("London"))
        );
        assert_eq!(
            merge_value(MergeStrategy::ReplaceIfBetter, Some(&text("CTO")), text("Chief Technology Officer"), origin),
            Some(text("Chief Technology Officer"))
        );
        assert_eq!(
            merge_value(MergeStrategy::ReplaceIfBetter, Some(&text("Chief")), text("Boss!"), origin),
            None
        );
        assert_eq!(
            merge_value(MergeStrategy::ReplaceIfBetter, Some(&AttributeValue::Number(3.0)), AttributeValue::Number(9.0), origin),
            None
        );
        assert_eq!(
            merge_value(MergeStrategy::ReplaceAlways, Some(&text("a")), text("b"), origin),
            Some(text("b"))
        );
        assert_eq!(merge_value(MergeStrategy::AgentOnly, None, text("x"), origin), None);
        assert_eq!(
            merge_value(MergeStrategy::AgentOnly, None, text("x"), WriteOrigin::Agent),
            Some(text("x"))
        );
        assert_eq!(
            merge_value(
                MergeStrategy::AppendUnique,
                Some(&AttributeValue::from(vec!["d1", "d2"])),
                AttributeValue::from(vec!["d2", "d3"]),
                origin
            ),
            Some(AttributeValue::from(vec!["d1", "d2", "d3"]))
        );
    }

    #[tokio::test]
    async fn test_create_uses_first_name_and_aliases_others() {
        let store = Arc::new(MemoryStore::new());
        let merger = merger(store.clone());
        let group = EntityGroup::new(
            "group_Person_0",
            "Person",
            vec![
                EntityRecord::new(0, "Person", "J. Smith").with_attribute("emails", vec!["j@x.com"]),
                EntityRecord::new(1, "Person", "John Smith").with_attribute("emails", vec!["j@x.com"]),
                EntityRecord::new(2, "Person", "J. Smith"),
            ],
        );
        let outcome = merger
            .merge_group(&group, "mail:42", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.canonical_id, "J. Smith");

        let stored = store.get_entity("Person", "J. Smith").await.unwrap().unwrap();
        assert_eq!(stored.list("aliases"), vec!["John Smith"]);
        assert_eq!(stored.list("emails"), vec!["j@x.com"]);
        assert_eq!(stored.list("sources"), vec!["mail:42"]);
    }

    #[tokio::test]
    async fn test_update_writes_only_changed_fields() {
        let store = Arc::new(MemoryStore::new());
        let existing = StoredEntity::new("Person", "Ada")
            .with_attribute("rawDescriptions", vec!["d1", "d2"])
            .with_attribute("location", "London")
            .with_attribute("sources", vec!["doc:1"]);
        store.insert_entity(existing.clone()).await;

        let merger = merger(store.clone());
        let mut group = EntityGroup::new(
            "group_Person_0",
            "Person",
            vec![EntityRecord::new(0, "Person", "Ada Lovelace")
                .with_attribute("description", vec!["d2", "d3"])
                .with_attribute("location", "Paris")
                .with_attribute("status", "archived")],
        );
        group.reconcile_to(existing);

        let outcome = merger
            .merge_group(&group, "doc:2", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.canonical_id, "Ada");
        assert_eq!(outcome.changed_fields, vec!["aliases", "rawDescriptions", "sources"]);

        let stored = store.get_entity("Person", "Ada").await.unwrap().unwrap();
        assert_eq!(stored.list("rawDescriptions"), vec!["d1", "d2", "d3"]);
        assert_eq!(stored.list("aliases"), vec!["Ada Lovelace"]);
        assert_eq!(stored.attributes.get("location"), Some(&AttributeValue::from("London")));
        assert!(!stored.attributes.contains_key("status"));
    }

    #[tokio::test]
    async fn test_unchanged_group_skips_the_store() {
        let existing = StoredEntity::new("Person", "Ada")
            .with_attribute("emails", vec!["ada@x.com"])
            .with_attribute("sources", vec!["doc:1"]);
        let mut store = MockEntityStore::new();
        store.expect_update_entity().never();

        let merger = merger(Arc::new(store));
        let mut group = EntityGroup::new(
            "group_Person_0",
            "Person",
            vec![EntityRecord::new(0, "Person", "Ada").with_attribute("email", "ada@x.com")],
        );
        group.reconcile_to(existing);

        let outcome = merger
            .merge_group(&group, "doc:1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.changed_fields.is_empty());
    }

    #[tokio::test]
    async fn test_payload_too_large_surfaces() {
        let mut store = MockEntityStore::new();
        store
            .expect_create_entity()
            .times(1)
            .returning(|_, _| Err(KgError::from_http_status(413, "request entity too large")));

        let merger = merger(Arc::new(store));
        let group = EntityGroup::new("group_Person_0", "Person", vec![EntityRecord::new(0, "Person", "Ada")]);
        let err = merger
            .merge_group(&group, "doc:1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_payload_too_large());
    }

    #[tokio::test]
    async fn test_only_content_changes_reembed() {
        let store = Arc::new(MemoryStore::new());
        let existing = StoredEntity::new("Person", "Ada")
            .with_attribute("emails", vec!["ada@x.com"])
            .with_attribute("rawDescriptions", vec!["d1"])
            .with_attribute("sources", vec!["doc:1"]);
        store.insert_entity(existing.clone()).await;

        let embedder = Arc::new(CountingEmbedder::default());
        let merger = AttributeMerger::new(
            config(),
            store.clone(),
            caller(),
            EmbeddingService::new(embedder.clone(), Duration::from_secs(1)),
        );
        let cancel = CancellationToken::new();
        let group_of = |record: EntityRecord, existing: StoredEntity| {
            let mut group = EntityGroup::new("group_Person_0", "Person", vec![record]);
            group.reconcile_to(existing);
            group
        };

        // New email and source only
        let group = group_of(
            EntityRecord::new(0, "Person", "Ada").with_attribute("email", "ada@y.org"),
            existing.clone(),
        );
        let outcome = merger.merge_group(&group, "doc:2", &cancel).await.unwrap();
        assert_eq!(outcome.changed_fields, vec!["emails", "sources"]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);

        let current = store.get_entity("Person", "Ada").await.unwrap().unwrap();
        let group = group_of(
            EntityRecord::new(0, "Person", "Ada").with_attribute("description", "d2"),
            current,
        );
        let outcome = merger.merge_group(&group, "doc:2", &cancel).await.unwrap();
        assert_eq!(outcome.changed_fields, vec!["rawDescriptions"]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let stored = store.get_entity("Person", "Ada").await.unwrap().unwrap();
        assert_eq!(stored.embedding, Some(vec![0.5; 4]));
    }

    #[tokio::test]
    async fn test_case_variants_are_not_aliases() {
        let store = Arc::new(MemoryStore::new());
        let merger = merger(store.clone());
        let group = EntityGroup::new(
            "group_Person_0",
            "Person",
            vec![
                EntityRecord::new(0, "Person", "Ada Lovelace"),
                EntityRecord::new(1, "Person", "ada lovelace "),
                EntityRecord::new(2, "Person", "Countess of Lovelace"),
                EntityRecord::new(3, "Person", "countess of lovelace"),
            ],
        );
        merger
            .merge_group(&group, "doc:1", &CancellationToken::new())
            .await
            .unwrap();
        let stored = store.get_entity("Person", "Ada Lovelace").await.unwrap().unwrap();
        assert_eq!(stored.list("aliases"), vec!["Countess of Lovelace"]);

        let mut update = EntityGroup::new(
            "group_Person_0",
            "Person",
            vec![
                EntityRecord::new(0, "Person", "ADA LOVELACE"),
                EntityRecord::new(1, "Person", "COUNTESS OF LOVELACE"),
            ],
        );
        update.reconcile_to(stored);
        let outcome = merger
            .merge_group(&update, "doc:1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.changed_fields.is_empty());
    }
}
