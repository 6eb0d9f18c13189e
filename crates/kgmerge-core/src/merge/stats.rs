//! Batch statistics.

use serde::{Deserialize, Serialize};

use crate::error::KgError;
use crate::types::GroupOutcome;

/// A failure scoped to one group or relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Group id or relation label.
    pub scope: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ItemError {
    pub fn from_error(scope: impl Into<String>, error: &KgError) -> Self {
        Self {
            scope: scope.into(),
            code: error.code().as_str().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// Per-group result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReport {
    pub group_id: String,
    pub entity_type: String,
    pub canonical_id: String,
    pub outcome: GroupOutcome,
    pub items: usize,
}

/// Statistics for one merged batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub provenance_id: String,
    pub entities_received: usize,
    /// Records skipped for a missing type or name.
    pub entities_invalid: usize,
    pub groups_processed: usize,
    pub entities_created: usize,
    /// Groups merged into an existing stored entity.
    pub entities_merged: usize,
    pub groups_failed: usize,
    pub groups: Vec<GroupReport>,
    pub relations_received: usize,
    pub relations_invalid: usize,
    pub relations_processed: usize,
    pub relations_skipped: usize,
    pub relations_failed: usize,
    pub errors: Vec<ItemError>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl BatchReport {
    pub fn new(provenance_id: impl Into<String>) -> Self {
        Self {
            provenance_id: provenance_id.into(),
            ..Self::default()
        }
    }

    /// Outcome recorded for a group.
    pub fn outcome_of(&self, group_id: &str) -> Option<GroupOutcome> {
        self.groups
            .iter()
            .find(|g| g.group_id == group_id)
            .map(|g| g.outcome)
    }

    pub fn has_failures(&self) -> bool {
        self.groups_failed > 0 || self.relations_failed > 0
    }
}

/// Sums over many batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTotals {
    pub batches: usize,
    pub entities_received: usize,
    pub entities_invalid: usize,
    pub groups_processed: usize,
    pub entities_created: usize,
    pub entities_merged: usize,
    pub groups_failed: usize,
    pub relations_received: usize,
    pub relations_processed: usize,
    pub relations_skipped: usize,
    pub relations_failed: usize,
    pub cancelled_batches: usize,
}

impl BatchTotals {
    pub fn add(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.entities_received += report.entities_received;
        self.entities_invalid += report.entities_invalid;
        self.groups_processed += report.groups_processed;
        self.entities_created += report.entities_created;
        self.entities_merged += report.entities_merged;
        self.groups_failed += report.groups_failed;
        self.relations_received += report.relations_received;
        self.relations_processed += report.relations_processed;
        self.relations_skipped += report.relations_skipped;
        self.relations_failed += report.relations_failed;
        if report.cancelled {
            self.cancelled_batches += 1;
        }
    }
}
