//! Reconciliation of groups against previously stored entities.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, MatchRule, RuleKind};
use crate::error::KgResult;
use crate::retry::StoreCaller;
use crate::traits::EntityStore;
use crate::types::{EntityGroup, EntityRecord, StoredEntity};

/// Looks up the stored entity a group refers to.
pub struct Reconciler {
    config: Arc<EngineConfig>,
    store: Arc<dyn EntityStore>,
    caller: StoreCaller,
}

impl Reconciler {
    pub fn new(config: Arc<EngineConfig>, store: Arc<dyn EntityStore>, caller: StoreCaller) -> Self {
        Self {
            config,
            store,
            caller,
        }
    }

    /// Attach the stored entity matching the group's representative, if any.
    pub async fn reconcile(&self, group: &mut EntityGroup, cancel: &CancellationToken) -> KgResult<()> {
        let Some(representative) = group.representative() else {
            return Ok(());
        };
        if let Some(existing) = self.find_existing(&group.entity_type, representative, cancel).await? {
            tracing::debug!(
                "Group {} matched existing entity {}",
                group.group_id,
                existing.name
            );
            group.reconcile_to(existing);
        } else {
            tracing::debug!("Group {} will create a new entity", group.group_id);
        }
        Ok(())
    }

    /// Evaluate the type's rules against the store, in priority order.
    ///
    /// Rules whose storage field the schema does not declare are skipped, as
    /// are search rules on fields that are not arrays. The first hit wins.
    pub async fn find_existing(
        &self,
        entity_type: &str,
        representative: &EntityRecord,
        cancel: &CancellationToken,
    ) -> KgResult<Option<StoredEntity>> {
        for rule in self.config.rules_for(entity_type) {
            if let Err(e) = self.config.check_rule_field(entity_type, rule) {
                tracing::debug!("{}", e);
                continue;
            }

            let is_array = self.config.is_array_field(entity_type, &rule.storage_field);
            if rule.kind == RuleKind::Search && !is_array {
                tracing::debug!(
                    "Skipping array search for {}.{} - not an array field",
                    entity_type,
                    rule.storage_field
                );
                continue;
            }

            for value in lookup_values(rule, representative) {
                let found = self
                    .caller
                    .call("find_entity_by_predicate", cancel, || {
                        self.store.find_entity_by_predicate(
                            entity_type,
                            &rule.storage_field,
                            &value,
                            is_array,
                        )
                    })
                    .await?;
                if found.is_some() {
                    return Ok(found);
                }
            }
        }
        Ok(None)
    }
}

/// Values of the representative a rule looks up, trimmed and non-empty.
fn lookup_values(rule: &MatchRule, record: &EntityRecord) -> Vec<String> {
    let Some(value) = record.field(&rule.source_field) else {
        return Vec::new();
    };
    let values = match rule.kind {
        RuleKind::Exact => value.as_text().into_iter().collect(),
        RuleKind::Search => value.to_list(),
    };
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntitySchema, RetryPolicy};
    use crate::error::KgError;
    use crate::traits::MockEntityStore;
    use mockall::predicate::eq;
    use std::time::Duration;

    fn org_config() -> Arc<EngineConfig> {
        Arc::new(
            EngineConfig::builder()
                .schema(
                    "Organization",
                    EntitySchema::new()
                        .with_field("name", "STRING")
                        .with_field("aliases", "STRING[]"),
                )
                .rule("Organization", MatchRule::exact("domain", 0.99, 1))
                .rule("Organization", MatchRule::exact("name", 0.9, 2))
                .rule("Organization", MatchRule::search("name", "aliases", 0.8, 3))
                .build()
                .unwrap(),
        )
    }

    fn caller() -> StoreCaller {
        StoreCaller::new(
            RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 1.0,
            },
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_skips_rule_for_field_missing_from_schema() {
        let mut store = MockEntityStore::new();
        store
            .expect_find_entity_by_predicate()
            .with(eq("Organization"), eq("name"), eq("Acme"), eq(false))
            .times(1)
            .returning(|_, _, _, _| Ok(Some(StoredEntity::new("Organization", "Acme"))));

        let reconciler = Reconciler::new(org_config(), Arc::new(store), caller());
        let record = EntityRecord::new(0, "Organization", "Acme").with_attribute("domain", "acme.com");
        let found = reconciler
            .find_existing("Organization", &record, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found.unwrap().name, "Acme");
    }

    #[tokio::test]
    async fn test_falls_through_to_array_search() {
        let mut store = MockEntityStore::new();
        store
            .expect_find_entity_by_predicate()
            .with(eq("Organization"), eq("name"), eq("ACME Inc"), eq(false))
            .times(1)
            .returning(|_, _, _, _| Ok(None));
        store
            .expect_find_entity_by_predicate()
            .with(eq("Organization"), eq("aliases"), eq("ACME Inc"), eq(true))
            .times(1)
            .returning(|_, _, _, _| Ok(Some(StoredEntity::new("Organization", "Acme"))));

        let reconciler = Reconciler::new(org_config(), Arc::new(store), caller());
        let mut group = EntityGroup::new(
            "group_Organization_0",
            "Organization",
            vec![EntityRecord::new(0, "Organization", "ACME Inc")],
        );
        reconciler.reconcile(&mut group, &CancellationToken::new()).await.unwrap();
        assert_eq!(group.existing_id.as_deref(), Some("Acme"));
        assert!(group.existing_snapshot.is_some());
    }

    #[tokio::test]
    async fn test_no_rules_means_not_found() {
        let store = MockEntityStore::new();
        let reconciler = Reconciler::new(org_config(), Arc::new(store), caller());
        let record = EntityRecord::new(0, "Topic", "Rust");
        let found = reconciler
            .find_existing("Topic", &record, &CancellationToken::new())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_then_surface() {
        let mut store = MockEntityStore::new();
        store
            .expect_find_entity_by_predicate()
            .times(3)
            .returning(|_, _, _, _| Err(KgError::transient_store("HTTP 503")));

        let reconciler = Reconciler::new(org_config(), Arc::new(store), caller());
        let record = EntityRecord::new(0, "Organization", "Acme");
        let err = reconciler
            .find_existing("Organization", &record, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
