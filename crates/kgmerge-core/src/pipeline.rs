//! Multi-batch driver.
//!
//! Batches are merged with bounded concurrency; each batch stays sequential
//! inside the engine. Reports come back in input order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, KgError, KgResult};
use crate::merge::{BatchReport, BatchTotals, ExtractedBatch, ItemError, MergeEngine};

/// A batch with its provenance id.
#[derive(Debug, Clone)]
pub struct ProvenancedBatch {
    pub provenance_id: String,
    pub batch: ExtractedBatch,
}

/// Aggregate result of a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    pub batches: Vec<BatchReport>,
    pub totals: BatchTotals,
    /// Batches with at least one failed group or relation.
    pub failed_batches: usize,
    /// Input files that could not be read or parsed.
    pub failed_inputs: Vec<ItemError>,
    pub elapsed_ms: u64,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.failed_batches == 0 && self.failed_inputs.is_empty()
    }
}

const BATCH_KEYS: [&str; 3] = ["entities", "relations", "relationships"];

fn invalid_input(stem: &str, reason: impl std::fmt::Display) -> KgError {
    KgError::Validation {
        message: format!("{} is not an extraction result: {}", stem, reason),
        code: ErrorCode::ValInvalidFormat,
        details: Default::default(),
        suggestion: Some(
            "Expected {\"results\": [...]} or {\"entities\": [...], \"relations\": [...]}".to_string(),
        ),
    }
}

/// Parse extractor output: either `{"results": [...]}` or a single batch.
///
/// Batches without a `source_id` are labelled `"{stem}:{index}"`.
pub fn parse_input(stem: &str, content: &str) -> KgResult<Vec<ProvenancedBatch>> {
    let mut document: serde_json::Value = serde_json::from_str(content).map_err(|e| invalid_input(stem, e))?;
    let object = document
        .as_object_mut()
        .ok_or_else(|| invalid_input(stem, "top level is not an object"))?;

    let batches: Vec<ExtractedBatch> = match object.remove("results") {
        Some(results) => serde_json::from_value(results).map_err(|e| invalid_input(stem, format!("results: {}", e)))?,
        None if BATCH_KEYS.iter().any(|k| object.contains_key(*k)) => {
            vec![serde_json::from_value(document).map_err(|e| invalid_input(stem, e))?]
        }
        None => return Err(invalid_input(stem, "no results, entities or relations")),
    };

    Ok(batches
        .into_iter()
        .enumerate()
        .map(|(i, batch)| ProvenancedBatch {
            provenance_id: batch
                .source_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("{}:{}", stem, i)),
            batch,
        })
        .collect())
}

/// Feeds batches to a shared [`MergeEngine`].
pub struct MergePipeline {
    engine: Arc<MergeEngine>,
    concurrency: usize,
}

impl MergePipeline {
    pub fn new(engine: Arc<MergeEngine>) -> Self {
        let concurrency = engine.config().max_concurrent_batches.max(1);
        Self { engine, concurrency }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    /// Merge batches, at most `concurrency` at a time.
    pub async fn process_batches(
        &self,
        batches: Vec<ProvenancedBatch>,
        cancel: &CancellationToken,
    ) -> PipelineReport {
        let started = Instant::now();
        tracing::info!(
            "Merging {} batches with concurrency {}",
            batches.len(),
            self.concurrency
        );

        let engine = &self.engine;
        let reports: Vec<BatchReport> = stream::iter(batches)
            .map(|item| async move {
                engine
                    .process_batch(&item.batch, &item.provenance_id, cancel)
                    .await
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = PipelineReport::default();
        for batch in &reports {
            report.totals.add(batch);
            if batch.has_failures() {
                report.failed_batches += 1;
            }
        }
        report.batches = reports;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Merge every batch in one extraction file.
    pub async fn process_file(&self, path: impl AsRef<Path>, cancel: &CancellationToken) -> KgResult<PipelineReport> {
        let path = path.as_ref();
        let batches = read_batches(path).await?;
        Ok(self.process_batches(batches, cancel).await)
    }

    /// Merge every `*.json` file in a directory, in sorted name order.
    ///
    /// Unreadable or malformed files are recorded and skipped.
    pub async fn process_directory(
        &self,
        dir: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> KgResult<PipelineReport> {
        let files = json_files(dir.as_ref()).await?;
        tracing::info!("Found {} extraction files in {}", files.len(), dir.as_ref().display());

        let mut batches = Vec::new();
        let mut failed_inputs = Vec::new();
        for file in &files {
            match read_batches(file).await {
                Ok(mut parsed) => batches.append(&mut parsed),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", file.display(), e);
                    failed_inputs.push(ItemError::from_error(file.display().to_string(), &e));
                }
            }
        }

        let mut report = self.process_batches(batches, cancel).await;
        report.failed_inputs = failed_inputs;
        Ok(report)
    }

    /// Merge a file or a directory of files.
    pub async fn process_path(&self, path: impl AsRef<Path>, cancel: &CancellationToken) -> KgResult<PipelineReport> {
        let path = path.as_ref();
        if tokio::fs::metadata(path).await?.is_dir() {
            self.process_directory(path, cancel).await
        } else {
            self.process_file(path, cancel).await
        }
    }
}

async fn read_batches(path: &Path) -> KgResult<Vec<ProvenancedBatch>> {
    let content = tokio::fs::read_to_string(path).await?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    parse_input(&stem, &content)
}

async fn json_files(dir: &Path) -> KgResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
