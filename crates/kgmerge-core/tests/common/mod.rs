//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kgmerge_core::types::{EntityPayload, RelationUpdate};
use kgmerge_core::{
    EngineConfig, EntitySchema, EntityStore, FieldSpec, KgError, KgResult, MatchRule, MemoryStore,
    MergeStrategy, RetryPolicy, StoredEntity, StoredRelation,
};
use tokio_util::sync::CancellationToken;

/// Person and Project types, matched on name then email.
pub fn people_config() -> EngineConfig {
    people_config_with_retry(RetryPolicy::none())
}

pub fn people_config_with_retry(retry: RetryPolicy) -> EngineConfig {
    EngineConfig::builder()
        .schema(
            "Person",
            EntitySchema::new()
                .with_field("name", "STRING")
                .with_field("aliases", "STRING[]")
                .with_field("emails", "STRING[]")
                .with_field("phones", "STRING[]")
                .with_field("rawDescriptions", "STRING[]")
                .with_field("title", "STRING")
                .with_field("sources", "STRING[]"),
        )
        .schema(
            "Project",
            EntitySchema::new()
                .with_field("name", "STRING")
                .with_field("aliases", "STRING[]")
                .with_field("sources", "STRING[]"),
        )
        .field("Person", "rawDescriptions", FieldSpec::mapped_from("description"))
        .field(
            "Person",
            "title",
            FieldSpec::default().with_strategy(MergeStrategy::PreserveExisting),
        )
        .rule("Person", MatchRule::exact("name", 0.95, 1))
        .rule("Person", MatchRule::search("emails", "emails", 0.9, 2))
        .rule("Person", MatchRule::search("phones", "phones", 0.85, 3))
        .rule("Project", MatchRule::exact("name", 0.95, 1))
        .retry(retry)
        .build()
        .expect("test config is valid")
}

/// Fast retries so tests do not sleep.
pub fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
    }
}

/// A [`MemoryStore`] that fails on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    /// Transient create failures left to inject.
    transient_creates: AtomicUsize,
    /// Every create fails with payload-too-large.
    oversized_creates: AtomicBool,
    /// Every update fails with a transient error.
    failing_updates: AtomicBool,
    /// Every endpoint lookup fails with a transient error.
    failing_lookups: AtomicBool,
    /// Cancelled right after the first successful create.
    cancel_after_create: Mutex<Option<CancellationToken>>,
    pub create_attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_creates_transiently(self, times: usize) -> Self {
        self.transient_creates.store(times, Ordering::SeqCst);
        self
    }

    pub fn reject_oversized_creates(self) -> Self {
        self.oversized_creates.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_updates(self) -> Self {
        self.failing_updates.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_lookups(self) -> Self {
        self.failing_lookups.store(true, Ordering::SeqCst);
        self
    }

    pub fn cancel_after_first_create(self, cancel: CancellationToken) -> Self {
        *self.cancel_after_create.lock().unwrap() = Some(cancel);
        self
    }
}

#[async_trait]
impl EntityStore for FlakyStore {
    async fn get_entity(&self, entity_type: &str, name: &str) -> KgResult<Option<StoredEntity>> {
        if self.failing_lookups.load(Ordering::SeqCst) {
            return Err(KgError::transient_store("lookup unavailable"));
        }
        self.inner.get_entity(entity_type, name).await
    }

    async fn create_entity(&self, entity_type: &str, payload: &EntityPayload) -> KgResult<StoredEntity> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        if self.oversized_creates.load(Ordering::SeqCst) {
            return Err(KgError::payload_too_large("entity exceeds the row size limit"));
        }
        let left = self.transient_creates.load(Ordering::SeqCst);
        if left > 0 {
            self.transient_creates.store(left - 1, Ordering::SeqCst);
            return Err(KgError::transient_store("connection reset"));
        }

        let stored = self.inner.create_entity(entity_type, payload).await?;
        if let Some(cancel) = self.cancel_after_create.lock().unwrap().take() {
            cancel.cancel();
        }
        Ok(stored)
    }

    async fn update_entity(
        &self,
        entity_type: &str,
        name: &str,
        payload: &EntityPayload,
    ) -> KgResult<StoredEntity> {
        if self.failing_updates.load(Ordering::SeqCst) {
            return Err(KgError::transient_store("update unavailable"));
        }
        self.inner.update_entity(entity_type, name, payload).await
    }

    async fn find_entity_by_predicate(
        &self,
        entity_type: &str,
        field: &str,
        value: &str,
        match_array: bool,
    ) -> KgResult<Option<StoredEntity>> {
        self.inner
            .find_entity_by_predicate(entity_type, field, value, match_array)
            .await
    }

    async fn get_relation(&self, id: &str) -> KgResult<Option<StoredRelation>> {
        self.inner.get_relation(id).await
    }

    async fn create_relation(&self, relation: &StoredRelation) -> KgResult<StoredRelation> {
        self.inner.create_relation(relation).await
    }

    async fn update_relation(&self, id: &str, update: &RelationUpdate) -> KgResult<StoredRelation> {
        self.inner.update_relation(id, update).await
    }
}

pub fn shared(config: EngineConfig) -> Arc<EngineConfig> {
    Arc::new(config)
}
