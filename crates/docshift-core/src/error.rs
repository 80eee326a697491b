//! Error types for the docshift engine
//!
//! Taxonomy:
//! - `ConfigError` / `ValidationError` block a job before any data is written
//! - `StoreError` (transient kinds) is recovered by bounded retry
//! - `TransformError` is recorded per document and never aborts a batch
//! - `IllegalStateTransition` is rejected synchronously
//! - `RollbackError` is terminal and requires an operator

use crate::types::{JobId, JobStatus};
use crate::validator::CheckOutcome;
use docshift_store::{DocKey, StoreError};

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Job configuration is out of range
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Readiness validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Operation not legal in the job's current state
    #[error("illegal state transition: {from} -> {to}")]
    IllegalStateTransition { from: JobStatus, to: JobStatus },

    /// Operation not legal in the job's current state
    #[error("cannot {operation} while job is {status}")]
    IllegalOperation {
        operation: &'static str,
        status: JobStatus,
    },

    /// Document store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Domain transform failure
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    /// Rollback failure
    #[error("rollback error: {0}")]
    Rollback(#[from] RollbackError),

    /// Job does not exist
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Job already reached a terminal status
    #[error("job {id} already finished as {status}")]
    JobFinished { id: JobId, status: JobStatus },

    /// Persisted administrative record could not be decoded
    #[error("corrupt ledger record {key}: {reason}")]
    CorruptRecord { key: DocKey, reason: String },

    /// Coordination task stopped unexpectedly
    #[error("job driver stopped: {0}")]
    DriverStopped(String),
}

impl EngineError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }

    /// Check if error requires an operator
    #[inline]
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(self, Self::Rollback(_) | Self::CorruptRecord { .. })
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Value outside its allowed range
    #[error("{field} = {value} is out of range (allowed: {allowed})")]
    OutOfRange {
        field: &'static str,
        value: String,
        allowed: &'static str,
    },

    /// Per-transaction operation count would exceed the store ceiling
    #[error("batch needs {ops} operations per transaction, store allows {limit}")]
    OperationBudgetExceeded { ops: usize, limit: usize },

    /// Per-request payload would exceed the store ceiling
    #[error("batch payload of {bytes} bytes exceeds store limit of {limit}")]
    PayloadBudgetExceeded { bytes: usize, limit: usize },

    /// Invalid job definition
    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    /// Config file could not be parsed
    #[error("config parse error: {0}")]
    Parse(String),

    /// Config file could not be read
    #[error("config io error: {0}")]
    Io(String),
}

/// Readiness validation failure listing every failed check
#[derive(Debug, Clone, thiserror::Error)]
#[error("readiness validation failed ({} checks): {}", .failures.len(), summarize(.failures))]
pub struct ValidationError {
    pub failures: Vec<CheckOutcome>,
}

fn summarize(failures: &[CheckOutcome]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.subject, f.detail))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-document transform failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// Transform has no inverse
    #[error("transform is not invertible")]
    NotInvertible,

    /// Document body is not shaped as expected
    #[error("malformed document: {0}")]
    Malformed(String),

    /// Old and new representations disagree
    #[error("conflicting field '{field}'")]
    Conflict { field: String },

    /// Domain rule rejected the document
    #[error("rejected: {0}")]
    Rejected(String),

    /// Document is neither in the source nor the target shape
    #[error("unexpected shape {found}, expected {expected}")]
    UnexpectedShape { found: u32, expected: u32 },
}

/// Rollback errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RollbackError {
    /// Target checkpoint belongs to another job
    #[error("checkpoint belongs to job {checkpoint_job}, plan is for job {plan_job}")]
    ForeignCheckpoint { plan_job: JobId, checkpoint_job: JobId },

    /// Target sequence number is not in the job's ledger
    #[error("checkpoint {0} not found in ledger")]
    UnknownCheckpoint(u64),

    /// Partial rollback needs a target checkpoint
    #[error("partial rollback requires a target checkpoint")]
    MissingTarget,

    /// No pre-migration snapshot exists for the job
    #[error("no backup snapshot recorded for job {0}")]
    MissingBackup(JobId),

    /// Document could not be reverted
    #[error("cannot revert {key}: {reason}")]
    Irreversible { key: DocKey, reason: String },

    /// Store kept failing past the retry budget
    #[error("rollback retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// Non-retryable store failure
    #[error("store error during rollback: {0}")]
    Store(String),
}
