//! The batch orchestrator.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::attributes::AttributeMerger;
use super::grouper::Grouper;
use super::matcher::Matcher;
use super::reconciler::Reconciler;
use super::relations::RelationConsolidator;
use super::stats::{BatchReport, GroupReport, ItemError};
use crate::config::EngineConfig;
use crate::embedding::EmbeddingService;
use crate::error::KgError;
use crate::retry::StoreCaller;
use crate::traits::{Embedder, EntityStore};
use crate::types::{CanonicalMap, EntityGroup, EntityRecord, GroupOutcome, RelationRecord};

/// One extractor output: raw entity and relation objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedBatch {
    /// Identifier of the source document, used as provenance.
    #[serde(default, alias = "item_id", skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub entities: Vec<serde_json::Value>,
    #[serde(default, alias = "relationships")]
    pub relations: Vec<serde_json::Value>,
}

/// Sequences matching, grouping, reconciliation, merging and relation
/// consolidation for one batch at a time.
pub struct MergeEngine {
    config: Arc<EngineConfig>,
    grouper: Grouper,
    reconciler: Reconciler,
    merger: AttributeMerger,
    relations: RelationConsolidator,
}

impl MergeEngine {
    /// Create an engine with embeddings disabled.
    pub fn new(config: Arc<EngineConfig>, store: Arc<dyn EntityStore>) -> Self {
        Self::with_embeddings(config, store, EmbeddingService::disabled())
    }

    /// Create an engine embedding through `embedder`.
    pub fn with_embedder(
        config: Arc<EngineConfig>,
        store: Arc<dyn EntityStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let embeddings = EmbeddingService::new(embedder, config.embedding_timeout());
        Self::with_embeddings(config, store, embeddings)
    }

    fn with_embeddings(
        config: Arc<EngineConfig>,
        store: Arc<dyn EntityStore>,
        embeddings: EmbeddingService,
    ) -> Self {
        let caller = StoreCaller::new(config.retry.clone(), config.store_timeout());
        Self {
            grouper: Grouper::new(Matcher::new(config.clone())),
            reconciler: Reconciler::new(config.clone(), store.clone(), caller.clone()),
            merger: AttributeMerger::new(config.clone(), store.clone(), caller.clone(), embeddings.clone()),
            relations: RelationConsolidator::new(store, caller, embeddings),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn grouper(&self) -> &Grouper {
        &self.grouper
    }

    pub fn merger(&self) -> &AttributeMerger {
        &self.merger
    }

    pub fn consolidator(&self) -> &RelationConsolidator {
        &self.relations
    }

    /// Parse raw entity objects, assigning positional ids. Invalid records are
    /// reported and left out.
    pub fn parse_entities(&self, raw: &[serde_json::Value], report: &mut BatchReport) -> Vec<EntityRecord> {
        let mut records = Vec::with_capacity(raw.len());
        for (i, value) in raw.iter().enumerate() {
            match EntityRecord::from_extracted(i, value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("Skipping entity #{}: {}", i, e);
                    report.entities_invalid += 1;
                    report.errors.push(ItemError::from_error(format!("entity #{}", i), &e));
                }
            }
        }
        records
    }

    fn parse_relations(&self, raw: &[serde_json::Value], report: &mut BatchReport) -> Vec<RelationRecord> {
        let mut records = Vec::with_capacity(raw.len());
        for (i, value) in raw.iter().enumerate() {
            match RelationRecord::from_extracted(value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::debug!("Skipping relation #{}: {}", i, e);
                    report.relations_invalid += 1;
                }
            }
        }
        records
    }

    /// Merge one batch.
    ///
    /// Never fails: every error is scoped to the group or relation it concerns
    /// and recorded in the report. Relations are processed only after all
    /// entity groups have resolved; a cancelled batch skips them.
    pub async fn process_batch(
        &self,
        batch: &ExtractedBatch,
        provenance_id: &str,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport::new(provenance_id);
        report.entities_received = batch.entities.len();
        report.relations_received = batch.relations.len();

        let records = self.parse_entities(&batch.entities, &mut report);
        tracing::info!("Assigned ids to {} entities", records.len());

        let groups = self.grouper.group(&records);
        tracing::info!("Formed {} groups from {} entities", groups.len(), records.len());

        let canonical = self.resolve_groups(groups, provenance_id, cancel, &mut report).await;

        if report.cancelled {
            tracing::warn!(
                "Batch {} cancelled after {} groups, abandoning relation processing",
                provenance_id,
                report.groups_processed
            );
        } else {
            let relations = self.parse_relations(&batch.relations, &mut report);
            let consolidation = self
                .relations
                .consolidate(&relations, &canonical, provenance_id, cancel)
                .await;
            report.relations_processed = consolidation.processed;
            report.relations_skipped = consolidation.skipped();
            report.relations_failed = consolidation.failed;
            report.errors.extend(consolidation.errors);
            report.cancelled = consolidation.cancelled;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Batch {}: {} groups ({} created, {} merged, {} failed), {} relations processed, {} skipped",
            provenance_id,
            report.groups_processed,
            report.entities_created,
            report.entities_merged,
            report.groups_failed,
            report.relations_processed,
            report.relations_skipped
        );
        report
    }

    /// Reconcile and merge every group in order, building the canonical map.
    async fn resolve_groups(
        &self,
        groups: Vec<EntityGroup>,
        provenance_id: &str,
        cancel: &CancellationToken,
        report: &mut BatchReport,
    ) -> CanonicalMap {
        let mut canonical = CanonicalMap::new();

        for mut group in groups {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let result = match self.reconciler.reconcile(&mut group, cancel).await {
                Ok(()) => self.merger.merge_group(&group, provenance_id, cancel).await,
                Err(e) => Err(e),
            };

            let (canonical_id, outcome) = match result {
                Ok(merged) => {
                    let outcome = if merged.created {
                        report.entities_created += 1;
                        GroupOutcome::Created
                    } else {
                        report.entities_merged += 1;
                        GroupOutcome::Merged
                    };
                    tracing::debug!(
                        "{} {} into {} from {} items",
                        outcome,
                        group.group_id,
                        merged.canonical_id,
                        group.items.len()
                    );
                    (merged.canonical_id, outcome)
                }
                Err(KgError::Cancelled { .. }) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    let e = e.in_context(&group.group_id);
                    if let Some(suggestion) = e.suggestion() {
                        tracing::error!("Failed to process group {}: {} ({})", group.group_id, e, suggestion);
                    } else {
                        tracing::error!("Failed to process group {}: {}", group.group_id, e);
                    }
                    report.groups_failed += 1;
                    report.errors.push(ItemError::from_error(group.group_id.clone(), &e));
                    let fallback = group
                        .existing_id
                        .clone()
                        .unwrap_or_else(|| group.items[0].name.clone());
                    (fallback, GroupOutcome::FailedWithFallback)
                }
            };

            report.groups_processed += 1;
            canonical.insert_all(group.names(), &canonical_id, &group.entity_type, outcome);
            canonical.insert_all([canonical_id.as_str()], &canonical_id, &group.entity_type, outcome);
            report.groups.push(GroupReport {
                group_id: group.group_id.clone(),
                entity_type: group.entity_type.clone(),
                canonical_id,
                outcome,
                items: group.items.len(),
            });
        }

        canonical
    }
}
