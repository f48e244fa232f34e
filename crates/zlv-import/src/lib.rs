//! Import reconciliation: schema validation, owner matching against the
//! persisted registry, conflict recording and run reporting.

use thiserror::Error;
use zlv_sources::SourceError;

mod cache;
mod config;
mod conflict;
mod matcher;
mod pipeline;
mod report;
mod similarity;
mod validate;

pub use cache::ComparisonCache;
pub use config::{ImportConfig, MatchPolicy, SimilarityWeights};
pub use conflict::{ConflictDetector, FieldPriority, LinkDecision, OwnerMerge};
pub use matcher::{KeyGuard, KeyedLocks, MatchOutcome, MatchResolution, OwnerMatcher};
pub use pipeline::ImportPipeline;
pub use report::{Report, ReportError, Reporter};
pub use similarity::{blocking_key, SimilarityPolicy, WeightedSimilarity};
pub use validate::{coerce_date, FieldSpec, Rule, Schema, ValidationError};

pub const CRATE_NAME: &str = "zlv-import";

/// Run-level failures. Per-record problems are reported, not raised.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("aborted on invalid record at line {line}: {message}")]
    AbortEarly { line: u64, message: String },
    #[error("import cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("pipeline stage failed: {0}")]
    Stage(String),
}
