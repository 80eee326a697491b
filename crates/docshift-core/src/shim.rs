//! Compatibility shim
//!
//! Serves the live application while a job is in flight. Reads are routed
//! by checkpoint coverage: a document inside a committed batch span is
//! served in the target shape, anything else in the source shape. A stored
//! document in the other shape is mapped on the fly on every read; nothing
//! is cached.
//!
//! Writes to documents the batches have not reached are stored as a dual
//! body (source fields plus forward-mapped fields) in the source shape, so
//! a later batch pass and a rollback both still see a valid document.
//!
//! The shim stays enabled through `completed` until the grace period has
//! elapsed, then retires and serves the target shape only.

use crate::checkpoint::{Checkpoint, LedgerView};
use crate::error::{EngineError, TransformError};
use crate::retry::RetryPolicy;
use crate::transform::Transform;
use crate::types::{JobStatus, MigrationJob};
use chrono::{DateTime, Utc};
use docshift_store::{DocKey, Document, DocumentStore, ShapeVersion, StoreError, Transaction};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const WRITE_ATTEMPTS: u32 = 5;

/// Lifecycle of the shim for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimState {
    /// No migrated data is visible; everything is served in the source shape
    Inactive,
    /// Cutover window: routing by checkpoint coverage
    Active,
    /// Job completed; old-shape reads still answered until `retire_at`
    Draining { retire_at: DateTime<Utc> },
    /// Grace period over; target shape only
    Retired,
}

impl ShimState {
    /// Whether old-shape reads are still answered
    #[inline]
    #[must_use]
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Active | Self::Draining { .. })
    }
}

#[derive(Debug)]
struct ShimView {
    status: JobStatus,
    completed_at: Option<DateTime<Utc>>,
    ledger: LedgerView,
}

/// Dual-shape read/write facade over the job's collection
#[derive(Debug)]
pub struct CompatibilityShim {
    store: Arc<dyn DocumentStore>,
    transform: Arc<dyn Transform>,
    collection: String,
    source_shape: ShapeVersion,
    target_shape: ShapeVersion,
    grace_period: Duration,
    policy: RetryPolicy,
    view: RwLock<ShimView>,
}

impl CompatibilityShim {
    /// Create shim for `job` over its current ledger
    #[must_use]
    pub fn new(
        job: &MigrationJob,
        store: Arc<dyn DocumentStore>,
        transform: Arc<dyn Transform>,
        ledger: LedgerView,
    ) -> Self {
        Self {
            store,
            transform,
            collection: job.collection.clone(),
            source_shape: job.source_shape,
            target_shape: job.target_shape,
            grace_period: job.config.shim_grace_period(),
            policy: RetryPolicy::for_batches(&job.config),
            view: RwLock::new(ShimView {
                status: job.status,
                completed_at: job.completed_at,
                ledger,
            }),
        }
    }

    /// Follow a job status change
    pub fn observe_status(&self, status: JobStatus, completed_at: Option<DateTime<Utc>>) {
        let mut view = self.view.write();
        view.status = status;
        view.completed_at = completed_at;
    }

    /// Extend coverage with a freshly committed checkpoint
    pub fn observe_checkpoint(&self, checkpoint: Checkpoint) {
        self.view.write().ledger.insert(checkpoint);
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ShimState {
        self.state_at(Utc::now())
    }

    /// State at `now`
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> ShimState {
        let view = self.view.read();
        match view.status {
            JobStatus::Running
            | JobStatus::PausedManual
            | JobStatus::PausedDegraded
            | JobStatus::Completing => ShimState::Active,
            JobStatus::Completed => {
                let grace = chrono::Duration::from_std(self.grace_period)
                    .unwrap_or_else(|_| chrono::Duration::days(365));
                match view.completed_at.and_then(|at| at.checked_add_signed(grace)) {
                    Some(retire_at) if retire_at <= now => ShimState::Retired,
                    Some(retire_at) => ShimState::Draining { retire_at },
                    None => ShimState::Draining { retire_at: now },
                }
            }
            JobStatus::Pending
            | JobStatus::Validating
            | JobStatus::RollingBack
            | JobStatus::RolledBack
            | JobStatus::RollbackFailed
            | JobStatus::Rejected => ShimState::Inactive,
        }
    }

    /// Whether `key` has been migrated by a committed batch
    #[must_use]
    pub fn covers(&self, key: &DocKey) -> bool {
        self.view.read().ledger.covers(key)
    }

    /// Shape the application is served for `key`
    #[must_use]
    pub fn serving_shape(&self, key: &DocKey) -> ShapeVersion {
        match self.state() {
            ShimState::Inactive => self.source_shape,
            ShimState::Active if self.covers(key) => self.target_shape,
            ShimState::Active => self.source_shape,
            ShimState::Draining { .. } | ShimState::Retired => self.target_shape,
        }
    }

    /// Read `key` in the shape it is currently served in
    ///
    /// # Errors
    /// - `EngineError::Store` if the store fails
    /// - `EngineError::Transform` if the stored document cannot be mapped
    pub async fn read(&self, key: &DocKey) -> Result<Option<Document>, EngineError> {
        let shape = self.serving_shape(key);
        self.read_as(key, shape).await
    }

    /// Read `key` mapped into `shape`
    ///
    /// # Errors
    /// - `EngineError::IllegalOperation` for a source-shape read after the shim retired
    /// - `EngineError::Store` if the store fails
    /// - `EngineError::Transform` if the stored document cannot be mapped
    pub async fn read_as(
        &self,
        key: &DocKey,
        shape: ShapeVersion,
    ) -> Result<Option<Document>, EngineError> {
        if shape == self.source_shape && self.state() == ShimState::Retired {
            return Err(EngineError::IllegalOperation {
                operation: "read_as",
                status: JobStatus::Completed,
            });
        }
        let Some(doc) = self.store.get(&self.collection, key).await? else {
            return Ok(None);
        };
        Ok(Some(self.project(doc, shape)?))
    }

    /// Write `body`, given in `shape`, for `key`
    ///
    /// Documents already migrated (or new keys inside a migrated span) are
    /// stored in the target shape; everything else as a dual body in the
    /// source shape. Concurrent writers are detected by revision and the
    /// write is retried.
    ///
    /// # Errors
    /// - `EngineError::Transform` if `body` cannot be mapped
    /// - `EngineError::Store` if the store keeps failing
    pub async fn write(
        &self,
        key: &DocKey,
        body: Value,
        shape: ShapeVersion,
    ) -> Result<Document, EngineError> {
        let source_body = if shape == self.source_shape {
            body
        } else if shape == self.target_shape {
            self.transform.inverse(key, &body)?
        } else {
            return Err(TransformError::UnexpectedShape {
                found: shape.0,
                expected: self.source_shape.0,
            }
            .into());
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_attempt(key, &source_body).await {
                Ok(doc) => return Ok(doc),
                Err(EngineError::Store(e))
                    if attempt < WRITE_ATTEMPTS
                        && (e.is_transient() || matches!(e, StoreError::Conflict { .. })) =>
                {
                    tracing::debug!(key = %key, attempt, error = %e, "shim write retrying");
                    tokio::time::sleep(self.policy.delay_for(attempt - 1, &e)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_attempt(&self, key: &DocKey, source_body: &Value) -> Result<Document, EngineError> {
        let current = self.store.get(&self.collection, key).await?;
        let migrated = match &current {
            Some(doc) => doc.shape == self.target_shape,
            None => match self.state() {
                ShimState::Active => self.covers(key),
                ShimState::Inactive => false,
                ShimState::Draining { .. } | ShimState::Retired => true,
            },
        };
        let doc = if migrated {
            let body = self.transform.forward(key, source_body)?;
            Document::new(key.clone(), self.target_shape, body)
        } else {
            let body = self.transform.dual(key, source_body)?;
            Document::new(key.clone(), self.source_shape, body)
        };

        let mut txn = Transaction::new();
        match &current {
            Some(existing) => txn.expect_revision(&self.collection, key.clone(), existing.revision),
            None => txn.expect_absent(&self.collection, key.clone()),
        }
        txn.push_put(&self.collection, doc.clone());
        let receipt = self.store.commit(txn).await?;
        tracing::debug!(key = %key, shape = %doc.shape, "shim write committed");
        Ok(Document {
            revision: receipt.revision,
            ..doc
        })
    }

    fn project(&self, doc: Document, shape: ShapeVersion) -> Result<Document, TransformError> {
        if doc.shape == shape {
            return Ok(doc);
        }
        let body = if doc.shape == self.source_shape && shape == self.target_shape {
            self.transform.forward(&doc.key, &doc.body)?
        } else if doc.shape == self.target_shape && shape == self.source_shape {
            self.transform.inverse(&doc.key, &doc.body)?
        } else {
            return Err(TransformError::UnexpectedShape {
                found: doc.shape.0,
                expected: shape.0,
            });
        };
        Ok(Document {
            shape,
            body,
            ..doc
        })
    }
}
