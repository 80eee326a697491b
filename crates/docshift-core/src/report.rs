//! Status reports and process exit codes
//!
//! Exit codes:
//! - `0` success, or running and healthy
//! - `1` readiness validation failed
//! - `2` degraded but running
//! - `3` rolled back
//! - `4` rollback failed, operator required

use crate::checkpoint::LedgerView;
use crate::error::EngineError;
use crate::monitor::HealthStatus;
use crate::rollback::{load_plans, RollbackOutcome, RollbackPlan};
use crate::types::{JobStatus, MigrationJob};
use docshift_store::DocumentStore;
use serde::Serialize;
use std::fmt;

/// Outcome class of a job, as reported to the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitStatus {
    Success,
    ValidationFailed,
    Degraded,
    RolledBack,
    RollbackFailed,
}

impl ExitStatus {
    /// Process exit code
    #[inline]
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::ValidationFailed => 1,
            Self::Degraded => 2,
            Self::RolledBack => 3,
            Self::RollbackFailed => 4,
        }
    }

    /// Classify a job by status and latest health
    #[must_use]
    pub fn for_job(job: &MigrationJob) -> Self {
        match job.status {
            JobStatus::Rejected => Self::ValidationFailed,
            JobStatus::RolledBack => Self::RolledBack,
            JobStatus::RollbackFailed => Self::RollbackFailed,
            JobStatus::Completed => Self::Success,
            JobStatus::PausedDegraded => Self::Degraded,
            _ => match job.last_health.as_ref().map(|h| h.status) {
                Some(HealthStatus::Degraded | HealthStatus::Critical) => Self::Degraded,
                _ => Self::Success,
            },
        }
    }
}

/// Ledger totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub checkpoints: usize,
    pub tail_sequence: Option<u64>,
    pub documents_migrated: usize,
    pub documents_failed: usize,
}

impl LedgerSummary {
    #[must_use]
    pub fn from_ledger(ledger: &LedgerView) -> Self {
        Self {
            checkpoints: ledger.len(),
            tail_sequence: ledger.tail().map(|c| c.sequence_number),
            documents_migrated: ledger.documents_migrated(),
            documents_failed: ledger.documents_failed(),
        }
    }
}

/// Everything `status` shows for one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusReport {
    pub job: MigrationJob,
    pub ledger: LedgerSummary,
    pub last_rollback: Option<RollbackPlan>,
    pub exit: ExitStatus,
}

impl JobStatusReport {
    /// Build report for `job` from its persisted ledger and rollback plans
    ///
    /// # Errors
    /// Returns `EngineError` if the store fails or a record is corrupt
    pub async fn load(store: &dyn DocumentStore, job: MigrationJob) -> Result<Self, EngineError> {
        let ledger = LedgerView::load(store, job.id).await?;
        let last_rollback = load_plans(store, job.id)
            .await?
            .into_iter()
            .max_by_key(|p| p.created_at);
        Ok(Self {
            exit: ExitStatus::for_job(&job),
            ledger: LedgerSummary::from_ledger(&ledger),
            last_rollback,
            job,
        })
    }
}

impl fmt::Display for JobStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let job = &self.job;
        writeln!(f, "job         {}", job.id)?;
        writeln!(
            f,
            "collection  {} ({} -> {})",
            job.collection, job.source_shape, job.target_shape
        )?;
        writeln!(f, "status      {}", job.status)?;
        if let Some(reason) = &job.status_reason {
            writeln!(f, "reason      {reason}")?;
        }
        writeln!(f, "started     {}", job.started_at.to_rfc3339())?;
        if let Some(done) = job.completed_at {
            writeln!(f, "finished    {}", done.to_rfc3339())?;
        }

        let ledger = &self.ledger;
        write!(f, "ledger      {} checkpoints", ledger.checkpoints)?;
        if let Some(tail) = ledger.tail_sequence {
            write!(f, " (tail #{tail})")?;
        }
        writeln!(
            f,
            ", {} migrated, {} failed",
            ledger.documents_migrated, ledger.documents_failed
        )?;

        match &job.last_health {
            Some(h) => writeln!(
                f,
                "health      {}: error rate {:.4}, p95 {:.1}ms, p99 {:.1}ms, {:.1} docs/s",
                h.status, h.error_rate, h.p95_latency_ms, h.p99_latency_ms, h.throughput_per_sec
            )?,
            None => writeln!(f, "health      no report yet")?,
        }

        if let Some(plan) = &self.last_rollback {
            let outcome = match &plan.outcome {
                RollbackOutcome::Pending => "in progress".to_string(),
                RollbackOutcome::NoOp => "no-op".to_string(),
                RollbackOutcome::Succeeded { documents_reverted } => {
                    format!("succeeded ({documents_reverted} documents reverted)")
                }
                RollbackOutcome::Failed { reason } => format!("FAILED: {reason}"),
            };
            writeln!(f, "rollback    {}: {outcome}", plan.strategy)?;
        }
        write!(f, "exit code   {}", self.exit.code())
    }
}
