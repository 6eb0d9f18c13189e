//! The merge engine: matching, grouping, reconciliation, attribute merging
//! and relation consolidation, sequenced per batch by [`MergeEngine`].

pub mod attributes;
pub mod engine;
pub mod grouper;
pub mod matcher;
pub mod reconciler;
pub mod relations;
pub mod stats;

pub use attributes::{AttributeMerger, MergeOutcome, WriteOrigin};
pub use engine::{ExtractedBatch, MergeEngine};
pub use grouper::Grouper;
pub use matcher::{MatchDecision, Matcher, FALLBACK_NAME_CONFIDENCE};
pub use reconciler::Reconciler;
pub use relations::{ConsolidationReport, RelationConsolidator};
pub use stats::{BatchReport, BatchTotals, GroupReport, ItemError};
