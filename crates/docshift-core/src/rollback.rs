//! Rollback manager
//!
//! Strategies:
//! - `partial`: inverse-transform every document in checkpoints after a
//!   target sequence number, newest checkpoint first
//! - `complete`: `partial` with target 0, reverting everything the job touched
//! - `backupRestore`: write back the pre-migration snapshot
//!
//! Documents already in the source shape are left untouched, so a rollback
//! can be re-run after a crash. Every chunk gets one attempt plus up to
//! `max_rollback_retries` retries; after that the rollback fails and the
//! orchestrator parks the job in `rollbackFailed`. Rollback never retries
//! indefinitely.

use crate::budget::OperationBudget;
use crate::checkpoint::{
    encode_record, load_job_records, Checkpoint, LedgerView, BACKUPS_COLLECTION,
    ROLLBACKS_COLLECTION,
};
use crate::error::{EngineError, RollbackError};
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::transform::Transform;
use crate::types::{JobId, MigrationJob};
use chrono::{DateTime, Utc};
use docshift_store::{DocKey, Document, DocumentStore, KeyRange, StoreError, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use ulid::Ulid;

const SPAN_PAGE: usize = 500;

/// How to revert a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollbackStrategy {
    Partial,
    Complete,
    BackupRestore,
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Partial => "partial",
            Self::Complete => "complete",
            Self::BackupRestore => "backupRestore",
        };
        f.write_str(name)
    }
}

impl FromStr for RollbackStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partial" => Ok(Self::Partial),
            "complete" => Ok(Self::Complete),
            "backupRestore" | "backup-restore" | "backup_restore" => Ok(Self::BackupRestore),
            other => Err(format!(
                "unknown strategy '{other}' (expected partial, complete or backupRestore)"
            )),
        }
    }
}

/// Reference to a checkpoint of a specific job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub job_id: JobId,
    /// Sequence number; 0 means "before the first checkpoint"
    pub sequence: u64,
}

impl CheckpointRef {
    #[inline]
    #[must_use]
    pub fn new(job_id: JobId, sequence: u64) -> Self {
        Self { job_id, sequence }
    }
}

/// Result of executing a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum RollbackOutcome {
    /// Not executed yet
    Pending,
    /// Nothing had been written; nothing to revert
    NoOp,
    Succeeded { documents_reverted: usize },
    Failed { reason: String },
}

/// A rollback decision and its result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub id: Ulid,
    pub job_id: JobId,
    pub strategy: RollbackStrategy,
    pub target_checkpoint: Option<CheckpointRef>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub outcome: RollbackOutcome,
    /// Why the rollback was triggered
    pub reason: Option<String>,
}

impl RollbackPlan {
    fn new(job_id: JobId, strategy: RollbackStrategy, target: Option<CheckpointRef>) -> Self {
        Self {
            id: Ulid::new(),
            job_id,
            strategy,
            target_checkpoint: target,
            created_at: Utc::now(),
            executed_at: None,
            outcome: RollbackOutcome::Pending,
            reason: None,
        }
    }

    /// Plan for a job that never wrote anything
    #[must_use]
    pub fn no_op(job_id: JobId, strategy: RollbackStrategy) -> Self {
        let mut plan = Self::new(job_id, strategy, None);
        plan.executed_at = Some(Utc::now());
        plan.outcome = RollbackOutcome::NoOp;
        plan
    }

    /// With trigger reason
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn record_key(&self) -> DocKey {
        DocKey::new(format!("{}/{}", self.job_id, self.id))
    }
}

/// Snapshot of one document taken before the job wrote anything
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub job_id: JobId,
    pub document: Document,
}

/// Backup collection key of a document
#[must_use]
pub fn backup_key(job_id: JobId, key: &DocKey) -> DocKey {
    DocKey::new(format!("{job_id}/{key}"))
}

/// Every rollback plan recorded for a job, oldest first
///
/// # Errors
/// Returns `EngineError` if the store fails or a record is corrupt
pub async fn load_plans(
    store: &dyn DocumentStore,
    job_id: JobId,
) -> Result<Vec<RollbackPlan>, EngineError> {
    load_job_records(store, ROLLBACKS_COLLECTION, job_id).await
}

/// Plans and executes rollbacks for one job
#[derive(Debug, Clone)]
pub struct RollbackManager {
    store: Arc<dyn DocumentStore>,
    transform: Arc<dyn Transform>,
    policy: RetryPolicy,
    budget: OperationBudget,
}

impl RollbackManager {
    /// Create manager for `job`
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConfig` if the job's budget no longer fits the store
    pub fn new(
        store: Arc<dyn DocumentStore>,
        transform: Arc<dyn Transform>,
        job: &MigrationJob,
    ) -> Result<Self, EngineError> {
        let budget = OperationBudget::for_config(&job.config, &store.limits())?;
        Ok(Self {
            store,
            transform,
            policy: RetryPolicy::for_rollback(&job.config),
            budget,
        })
    }

    /// Strategy used when a job is aborted
    #[must_use]
    pub fn default_strategy(&self) -> RollbackStrategy {
        if self.transform.is_invertible() {
            RollbackStrategy::Complete
        } else {
            RollbackStrategy::BackupRestore
        }
    }

    /// Build a plan, checking it targets this job's ledger
    ///
    /// # Errors
    /// - `RollbackError::ForeignCheckpoint` if `target` belongs to another job
    /// - `RollbackError::UnknownCheckpoint` if the sequence is not in the ledger
    /// - `RollbackError::MissingTarget` for `partial` without a target
    /// - `RollbackError::MissingBackup` for `backupRestore` without a snapshot
    pub fn plan(
        &self,
        job: &MigrationJob,
        strategy: RollbackStrategy,
        target: Option<CheckpointRef>,
        ledger: &LedgerView,
    ) -> Result<RollbackPlan, RollbackError> {
        if let Some(target) = target {
            if target.job_id != job.id {
                return Err(RollbackError::ForeignCheckpoint {
                    plan_job: job.id,
                    checkpoint_job: target.job_id,
                });
            }
            if target.sequence != 0 && ledger.get(target.sequence).is_none() {
                return Err(RollbackError::UnknownCheckpoint(target.sequence));
            }
        }
        let target = match strategy {
            RollbackStrategy::Partial => Some(target.ok_or(RollbackError::MissingTarget)?),
            RollbackStrategy::Complete => Some(CheckpointRef::new(job.id, 0)),
            RollbackStrategy::BackupRestore => {
                if !job.backup_complete {
                    return Err(RollbackError::MissingBackup(job.id));
                }
                None
            }
        };
        Ok(RollbackPlan::new(job.id, strategy, target))
    }

    /// Plan and execute in one step
    ///
    /// # Errors
    /// Returns `RollbackError` if planning or execution fails; the failed
    /// plan is still recorded
    pub async fn rollback(
        &self,
        job: &MigrationJob,
        strategy: RollbackStrategy,
        target: Option<CheckpointRef>,
        reason: Option<String>,
    ) -> Result<RollbackPlan, RollbackError> {
        let ledger = LedgerView::load(self.store.as_ref(), job.id)
            .await
            .map_err(|e| RollbackError::Store(e.to_string()))?;
        let mut plan = self.plan(job, strategy, target, &ledger)?;
        plan.reason = reason;
        self.execute(job, &mut plan, &ledger).await?;
        Ok(plan)
    }

    /// Execute `plan` against the current ledger
    ///
    /// Records the plan before and after execution.
    ///
    /// # Errors
    /// Returns `RollbackError` if any document could not be reverted
    pub async fn execute(
        &self,
        job: &MigrationJob,
        plan: &mut RollbackPlan,
        ledger: &LedgerView,
    ) -> Result<usize, RollbackError> {
        if plan.job_id != job.id {
            return Err(RollbackError::ForeignCheckpoint {
                plan_job: job.id,
                checkpoint_job: plan.job_id,
            });
        }
        self.record(plan).await;
        tracing::info!(
            job_id = %job.id,
            strategy = %plan.strategy,
            target = plan.target_checkpoint.map(|t| t.sequence),
            "executing rollback"
        );

        let result = match plan.strategy {
            RollbackStrategy::Partial | RollbackStrategy::Complete => {
                let target = plan.target_checkpoint.map_or(0, |t| t.sequence);
                self.revert_checkpoints(job, ledger, target).await
            }
            RollbackStrategy::BackupRestore => self.restore_backup(job, ledger).await,
        };

        plan.executed_at = Some(Utc::now());
        plan.outcome = match &result {
            Ok(documents_reverted) => RollbackOutcome::Succeeded {
                documents_reverted: *documents_reverted,
            },
            Err(e) => RollbackOutcome::Failed {
                reason: e.to_string(),
            },
        };
        self.record(plan).await;
        result
    }

    /// Record a no-op plan for a job whose ledger is empty
    pub async fn record_no_op(
        &self,
        job: &MigrationJob,
        strategy: RollbackStrategy,
        reason: Option<String>,
    ) -> RollbackPlan {
        let mut plan = RollbackPlan::no_op(job.id, strategy);
        plan.reason = reason;
        tracing::info!(job_id = %job.id, %strategy, "nothing written, recording no-op rollback");
        self.record(&plan).await;
        plan
    }

    async fn record(&self, plan: &RollbackPlan) {
        let doc = match encode_record(plan.record_key(), plan) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(job_id = %plan.job_id, error = %e, "cannot encode rollback plan");
                return;
            }
        };
        if let Err(e) = self
            .store
            .commit(Transaction::new().put(ROLLBACKS_COLLECTION, doc))
            .await
        {
            tracing::warn!(job_id = %plan.job_id, error = %e, "cannot record rollback plan");
        }
    }

    async fn revert_checkpoints(
        &self,
        job: &MigrationJob,
        ledger: &LedgerView,
        target: u64,
    ) -> Result<usize, RollbackError> {
        let failed = ledger.failed_keys();
        let mut reverted = 0;
        for checkpoint in ledger.after(target) {
            let migrated = self.migrated_in(job, checkpoint, &failed).await?;
            let runs = self.budget.split_by_payload(
                &migrated,
                self.budget.rollback_chunk(),
                Document::encoded_len,
            );
            for run in runs {
                let keys: Vec<DocKey> = run.iter().map(|d| d.key.clone()).collect();
                reverted += self.revert_chunk(job, &keys).await?;
            }
            tracing::debug!(
                job_id = %job.id,
                sequence = checkpoint.sequence_number,
                documents = migrated.len(),
                "reverted checkpoint"
            );
        }
        Ok(reverted)
    }

    /// Documents in a checkpoint's span still in the target shape
    async fn migrated_in(
        &self,
        job: &MigrationJob,
        checkpoint: &Checkpoint,
        failed: &BTreeSet<DocKey>,
    ) -> Result<Vec<Document>, RollbackError> {
        let outcome = retry(&self.policy, None, |_| {
            scan_span(self.store.as_ref(), &job.collection, checkpoint)
        })
        .await;
        let docs = settle(outcome)?;
        Ok(docs
            .into_iter()
            .filter(|d| d.shape == job.target_shape && !failed.contains(&d.key))
            .collect())
    }

    async fn revert_chunk(&self, job: &MigrationJob, keys: &[DocKey]) -> Result<usize, RollbackError> {
        let outcome = retry(&self.policy, None, |_| self.revert_attempt(job, keys)).await;
        settle(outcome)?
    }

    async fn revert_attempt(
        &self,
        job: &MigrationJob,
        keys: &[DocKey],
    ) -> Result<Result<usize, RollbackError>, StoreError> {
        let mut txn = Transaction::new();
        txn.declare_reads(keys.len());
        let mut writes = 0;
        for key in keys {
            let Some(doc) = self.store.get(&job.collection, key).await? else {
                continue;
            };
            if doc.shape != job.target_shape {
                continue;
            }
            let body = match self.transform.inverse(key, &doc.body) {
                Ok(body) => body,
                Err(e) => {
                    return Ok(Err(RollbackError::Irreversible {
                        key: key.clone(),
                        reason: e.to_string(),
                    }))
                }
            };
            txn.expect_revision(&job.collection, key.clone(), doc.revision);
            txn.push_put(&job.collection, Document::new(key.clone(), job.source_shape, body));
            writes += 1;
        }
        if writes == 0 {
            return Ok(Ok(0));
        }
        txn.declare_index_updates(writes * self.budget.index_updates_per_document);
        self.store.commit(txn).await?;
        Ok(Ok(writes))
    }

    async fn restore_backup(&self, job: &MigrationJob, ledger: &LedgerView) -> Result<usize, RollbackError> {
        if !job.backup_complete {
            return Err(RollbackError::MissingBackup(job.id));
        }
        let records = load_job_records::<BackupRecord>(self.store.as_ref(), BACKUPS_COLLECTION, job.id)
            .await
            .map_err(|e| RollbackError::Store(e.to_string()))?;

        let mut restored = 0;
        let runs = self.budget.split_by_payload(&records, self.budget.restore_chunk(), |r| {
            r.document.encoded_len()
        });
        for chunk in runs {
            let outcome = retry(&self.policy, None, |_| self.restore_attempt(job, chunk)).await;
            restored += settle(outcome)?;
        }

        // documents created after the snapshot inside migrated spans
        if self.transform.is_invertible() {
            restored += self.revert_checkpoints(job, ledger, 0).await?;
        } else {
            let failed = ledger.failed_keys();
            let mut leftover = 0;
            for checkpoint in ledger.checkpoints() {
                leftover += self.migrated_in(job, checkpoint, &failed).await?.len();
            }
            if leftover > 0 {
                tracing::warn!(
                    job_id = %job.id,
                    documents = leftover,
                    "documents created during the run remain in the target shape"
                );
            }
        }
        Ok(restored)
    }

    async fn restore_attempt(
        &self,
        job: &MigrationJob,
        records: &[BackupRecord],
    ) -> Result<usize, StoreError> {
        let mut txn = Transaction::new();
        txn.declare_reads(records.len() * 2);
        let mut writes = 0;
        for record in records {
            let original = &record.document;
            match self.store.get(&job.collection, &original.key).await? {
                Some(current) if current.shape == original.shape && current.body == original.body => {
                    continue;
                }
                Some(current) => {
                    txn.expect_revision(&job.collection, current.key.clone(), current.revision);
                }
                None => txn.expect_absent(&job.collection, original.key.clone()),
            }
            txn.push_put(
                &job.collection,
                Document::new(original.key.clone(), original.shape, original.body.clone()),
            );
            writes += 1;
        }
        if writes == 0 {
            return Ok(0);
        }
        txn.declare_index_updates(writes * self.budget.index_updates_per_document);
        self.store.commit(txn).await?;
        Ok(writes)
    }
}

/// Documents inside `[first_key, last_processed_key]` of a checkpoint
async fn scan_span(
    store: &dyn DocumentStore,
    collection: &str,
    checkpoint: &Checkpoint,
) -> Result<Vec<Document>, StoreError> {
    let range = KeyRange::new(Some(checkpoint.first_key.clone()), None);
    let mut out = Vec::new();
    let mut after: Option<DocKey> = None;
    loop {
        let page = store.scan(collection, &range, after.as_ref(), SPAN_PAGE).await?;
        let full = page.len() == SPAN_PAGE;
        for doc in page {
            if doc.key > checkpoint.last_processed_key {
                return Ok(out);
            }
            after = Some(doc.key.clone());
            out.push(doc);
        }
        if !full {
            return Ok(out);
        }
    }
}

fn settle<T>(outcome: RetryOutcome<T>) -> Result<T, RollbackError> {
    match outcome {
        RetryOutcome::Succeeded { value, .. } => Ok(value),
        RetryOutcome::Exhausted {
            attempts,
            last_error,
        } => Err(RollbackError::Exhausted {
            attempts,
            last_error: last_error.to_string(),
        }),
        RetryOutcome::Fatal { error, .. } => Err(RollbackError::Store(error.to_string())),
    }
}
