//! Batch processor and partition workers
//!
//! Each batch:
//! 1. scans up to `batch_size` documents after the partition cursor, in key order
//! 2. applies the transform to every source-shape document
//! 3. commits the rewritten documents and the checkpoint in one transaction
//!
//! Documents already in the target shape are skipped, so replaying a
//! committed range never transforms a document twice. Every rewrite is
//! guarded by the revision that was read; a concurrent write makes the
//! commit conflict and the retry rescans.
//!
//! A batch whose retries are exhausted is marked failed: its keys are
//! carried into the next checkpoint of the partition as failed documents
//! and the cursor moves past them.

use crate::checkpoint::{Checkpoint, CheckpointStore, LedgerView};
use crate::error::{EngineError, TransformError};
use crate::monitor::{BatchSample, InFlightMemory};
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::transform::Transform;
use crate::types::{JobId, MigrationJob, Partition};
use chrono::Utc;
use docshift_store::{DocKey, Document, DocumentStore, ShapeVersion, StoreError, Transaction};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::Instrument;

/// In-flight unit of work for one transactional attempt
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub partition: usize,
    pub keys: Vec<DocKey>,
    pub transform: Arc<dyn Transform>,
    pub deadline: Instant,
}

/// Resumable position inside one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    partition: Partition,
    after: Option<DocKey>,
    carried_failures: Vec<DocKey>,
    finished: bool,
}

impl PartitionCursor {
    /// Cursor at the start of `partition`
    #[must_use]
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            after: None,
            carried_failures: Vec::new(),
            finished: false,
        }
    }

    /// Cursor just past the partition's ledger tail
    #[must_use]
    pub fn resume(partition: Partition, ledger: &LedgerView) -> Self {
        let after = ledger
            .partition_tail(partition.index)
            .map(|c| c.last_processed_key.clone());
        Self {
            after,
            ..Self::new(partition)
        }
    }

    #[inline]
    #[must_use]
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Last key the partition has moved past
    #[inline]
    #[must_use]
    pub fn after(&self) -> Option<&DocKey> {
        self.after.as_ref()
    }

    /// Keys of an exhausted batch not yet recorded in a checkpoint
    #[inline]
    #[must_use]
    pub fn carried_failures(&self) -> &[DocKey] {
        &self.carried_failures
    }

    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// What happened to one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Documents and checkpoint committed
    Committed,
    /// Every scanned document was already migrated; nothing written
    Skipped,
    /// Retries exhausted; scanned documents recorded as failed
    Failed,
    /// Partition has no documents left
    Finished,
}

/// Outcome of [`BatchProcessor::process_next_batch`]
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub partition: usize,
    pub status: BatchStatus,
    pub checkpoint: Option<Checkpoint>,
    pub documents_scanned: usize,
    pub documents_migrated: usize,
    pub documents_skipped: usize,
    /// Documents that failed in this batch (transform errors, or every
    /// eligible document of an exhausted batch)
    pub documents_failed: usize,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

impl BatchResult {
    fn new(partition: usize, status: BatchStatus) -> Self {
        Self {
            partition,
            status,
            checkpoint: None,
            documents_scanned: 0,
            documents_migrated: 0,
            documents_skipped: 0,
            documents_failed: 0,
            attempts: 0,
            duration: Duration::ZERO,
            error: None,
        }
    }

    /// Documents that reached the transform
    #[inline]
    #[must_use]
    pub fn documents_processed(&self) -> usize {
        self.documents_migrated + self.documents_failed
    }
}

#[derive(Debug, Default)]
struct AttemptOutcome {
    checkpoint: Option<Checkpoint>,
    scanned: usize,
    migrated: usize,
    skipped: usize,
    failed: usize,
    last_key: Option<DocKey>,
    bytes: usize,
}

/// Executes batches for one job
#[derive(Debug)]
pub struct BatchProcessor {
    store: Arc<dyn DocumentStore>,
    transform: Arc<dyn Transform>,
    checkpoints: Arc<CheckpointStore>,
    job_id: JobId,
    collection: String,
    source_shape: ShapeVersion,
    target_shape: ShapeVersion,
    batch_size: usize,
    index_updates_per_document: usize,
    policy: RetryPolicy,
    batch_deadline: Duration,
    samples: Option<mpsc::Sender<BatchSample>>,
    memory: Option<Arc<InFlightMemory>>,
}

impl BatchProcessor {
    /// Create processor for `job`
    #[must_use]
    pub fn new(
        job: &MigrationJob,
        store: Arc<dyn DocumentStore>,
        transform: Arc<dyn Transform>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            store,
            transform,
            checkpoints,
            job_id: job.id,
            collection: job.collection.clone(),
            source_shape: job.source_shape,
            target_shape: job.target_shape,
            batch_size: job.config.batch_size,
            index_updates_per_document: job.config.index_updates_per_document,
            policy: RetryPolicy::for_batches(&job.config),
            batch_deadline: job.config.batch_deadline(),
            samples: None,
            memory: None,
        }
    }

    /// With monitor sample channel
    #[must_use]
    pub fn with_samples(mut self, samples: mpsc::Sender<BatchSample>) -> Self {
        self.samples = Some(samples);
        self
    }

    /// With in-flight memory gauge
    #[must_use]
    pub fn with_memory(mut self, memory: Arc<InFlightMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Process the next batch of `cursor`'s partition and advance the cursor
    ///
    /// # Errors
    /// Returns `EngineError::Store` if the batch failed before any document
    /// could be read, so the cursor cannot move past it
    pub async fn process_next_batch(
        &self,
        cursor: &mut PartitionCursor,
    ) -> Result<BatchResult, EngineError> {
        let partition = cursor.partition.index;
        if cursor.finished {
            return Ok(BatchResult::new(partition, BatchStatus::Finished));
        }

        let started = Instant::now();
        let deadline = started + self.batch_deadline;
        let scanned: Mutex<Vec<(DocKey, ShapeVersion)>> = Mutex::new(Vec::new());
        let after = cursor.after.clone();
        let carried_failures = cursor.carried_failures.clone();

        let target = &cursor.partition;
        let (after, carried, scanned_ref) = (after.as_ref(), carried_failures.as_slice(), &scanned);
        let outcome = retry(&self.policy, Some(deadline), move |attempt| {
            if attempt > 1 {
                tracing::debug!(partition, attempt, "retrying batch");
            }
            self.attempt(target, after, carried, scanned_ref, deadline)
        })
        .await;
        let attempts = outcome.attempts();

        let result = match outcome {
            RetryOutcome::Succeeded { value, .. } => {
                let status = match (&value.last_key, &value.checkpoint) {
                    (None, _) => BatchStatus::Finished,
                    (Some(_), Some(_)) => BatchStatus::Committed,
                    (Some(_), None) => BatchStatus::Skipped,
                };
                if value.checkpoint.is_some() {
                    cursor.carried_failures.clear();
                }
                match &value.last_key {
                    Some(last) => cursor.after = Some(last.clone()),
                    None => cursor.finished = true,
                }
                let mut result = BatchResult::new(partition, status);
                result.documents_scanned = value.scanned;
                result.documents_migrated = value.migrated;
                result.documents_skipped = value.skipped;
                result.documents_failed = value.failed;
                result.checkpoint = value.checkpoint;
                self.sample(started, value.migrated + value.failed, value.failed, value.bytes);
                result
            }
            RetryOutcome::Exhausted { last_error: error, .. }
            | RetryOutcome::Fatal { error, .. } => {
                let scanned = std::mem::take(&mut *scanned.lock());
                let Some((last, _)) = scanned.last().cloned() else {
                    return Err(EngineError::Store(error));
                };
                let eligible: Vec<DocKey> = scanned
                    .into_iter()
                    .filter(|(_, shape)| *shape != self.target_shape)
                    .map(|(key, _)| key)
                    .collect();
                tracing::warn!(
                    job_id = %self.job_id,
                    partition,
                    attempts,
                    documents = eligible.len(),
                    error = %error,
                    "batch failed, marking documents failed"
                );

                let mut result = BatchResult::new(partition, BatchStatus::Failed);
                result.documents_failed = eligible.len();
                result.error = Some(error.to_string());
                self.sample(started, eligible.len(), eligible.len(), 0);
                cursor.after = Some(last);
                cursor.carried_failures.extend(eligible);
                result
            }
        };

        Ok(BatchResult {
            attempts,
            duration: started.elapsed(),
            ..result
        })
    }

    async fn attempt(
        &self,
        partition: &Partition,
        after: Option<&DocKey>,
        carried: &[DocKey],
        scanned: &Mutex<Vec<(DocKey, ShapeVersion)>>,
        deadline: Instant,
    ) -> Result<AttemptOutcome, StoreError> {
        let started = Instant::now();
        let docs = self
            .store
            .scan(&self.collection, &partition.range, after, self.batch_size)
            .await?;
        *scanned.lock() = docs.iter().map(|d| (d.key.clone(), d.shape)).collect();
        let mut held = self
            .memory
            .as_ref()
            .map(|m| m.reserve(docs.iter().map(Document::encoded_len).sum()));

        let op = BatchOperation {
            partition: partition.index,
            keys: docs.iter().map(|d| d.key.clone()).collect(),
            transform: self.transform.clone(),
            deadline,
        };
        let mut outcome = AttemptOutcome {
            scanned: docs.len(),
            last_key: op.keys.last().cloned(),
            ..AttemptOutcome::default()
        };

        let mut txn = Transaction::new();
        txn.declare_reads(docs.len());
        let mut failed_keys = carried.to_vec();
        for doc in docs {
            match self.migrate(&op, &doc) {
                Ok(Some(migrated)) => {
                    txn.expect_revision(&self.collection, doc.key.clone(), doc.revision);
                    let len = migrated.encoded_len();
                    if let Some(held) = held.as_mut() {
                        held.grow(len);
                    }
                    outcome.bytes += len;
                    txn.push_put(&self.collection, migrated);
                    outcome.migrated += 1;
                }
                Ok(None) => outcome.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        partition = op.partition,
                        key = %doc.key,
                        error = %e,
                        "transform failed"
                    );
                    outcome.failed += 1;
                    failed_keys.push(doc.key);
                }
            }
        }

        if outcome.migrated == 0 && failed_keys.is_empty() {
            return Ok(outcome);
        }
        let (Some(first_key), Some(last_key)) = (
            op.keys.first().or(carried.first()).cloned(),
            op.keys.last().or(carried.last()).cloned(),
        ) else {
            return Ok(outcome);
        };

        let checkpoint = Checkpoint {
            job_id: self.job_id,
            partition: op.partition,
            sequence_number: self.checkpoints.allocate(),
            first_key,
            last_processed_key: last_key,
            documents_migrated: outcome.migrated,
            documents_failed: failed_keys.len(),
            failed_keys,
            timestamp: Utc::now(),
            batch_duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        txn.declare_index_updates(outcome.migrated * self.index_updates_per_document);
        self.checkpoints
            .stage(&mut txn, &checkpoint)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.commit(txn).await?;

        tracing::debug!(
            job_id = %self.job_id,
            partition = op.partition,
            sequence = checkpoint.sequence_number,
            migrated = outcome.migrated,
            failed = checkpoint.documents_failed,
            "batch committed"
        );
        outcome.checkpoint = Some(checkpoint);
        Ok(outcome)
    }

    /// Target-shape document, `None` if already migrated
    fn migrate(&self, op: &BatchOperation, doc: &Document) -> Result<Option<Document>, TransformError> {
        if doc.shape == self.target_shape {
            return Ok(None);
        }
        if doc.shape != self.source_shape {
            return Err(TransformError::UnexpectedShape {
                found: doc.shape.0,
                expected: self.source_shape.0,
            });
        }
        let body = op.transform.forward(&doc.key, &doc.body)?;
        Ok(Some(Document::new(doc.key.clone(), self.target_shape, body)))
    }

    fn sample(&self, started: Instant, processed: usize, failed: usize, bytes: usize) {
        if let Some(samples) = &self.samples {
            // best-effort: a full monitor buffer drops the sample
            let _ = samples.try_send(BatchSample {
                duration: started.elapsed(),
                processed,
                failed,
                bytes_written: bytes,
            });
        }
    }
}

/// Control signal broadcast to partition workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Run,
    /// Hold at the next batch boundary
    Pause,
    /// Exit at the next batch boundary
    Stop,
}

/// Message from a partition worker to the orchestrator
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Batch(BatchResult),
    Finished { partition: usize },
    Failed { partition: usize, error: String },
}

/// Process one partition until it is finished or stopped
///
/// Pause and stop take effect between batches; an in-flight transaction
/// always runs to commit or failure first.
pub async fn run_partition(
    processor: Arc<BatchProcessor>,
    mut cursor: PartitionCursor,
    mut signal: watch::Receiver<WorkerSignal>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> PartitionCursor {
    let partition = cursor.partition.index;
    let span = tracing::info_span!("partition", job_id = %processor.job_id, partition);
    async move {
        tracing::debug!(range = %cursor.partition.range, "worker started");
        loop {
            loop {
                let current = *signal.borrow_and_update();
                match current {
                    WorkerSignal::Run => break,
                    WorkerSignal::Stop => {
                        tracing::debug!("worker stopped");
                        return cursor;
                    }
                    WorkerSignal::Pause => {
                        if signal.changed().await.is_err() {
                            return cursor;
                        }
                    }
                }
            }

            match processor.process_next_batch(&mut cursor).await {
                Ok(result) => {
                    let finished = result.status == BatchStatus::Finished;
                    let _ = events.send(WorkerEvent::Batch(result));
                    if finished {
                        tracing::debug!("partition finished");
                        let _ = events.send(WorkerEvent::Finished { partition });
                        return cursor;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "partition worker cannot make progress");
                    let _ = events.send(WorkerEvent::Failed {
                        partition,
                        error: e.to_string(),
                    });
                    return cursor;
                }
            }
        }
    }
    .instrument(span)
    .await
}
