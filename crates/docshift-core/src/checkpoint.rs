//! Checkpoint ledger
//!
//! Checkpoints are immutable, append-only progress markers, one per
//! committed batch. They live in the `_docshift_checkpoints` admin
//! collection under `{job}/{partition:04}/{sequence:012}`, so each worker
//! appends under its own partition namespace and a prefix scan of `{job}/`
//! returns the whole ledger.
//!
//! Invariants:
//! - sequence numbers start at 1 and only grow
//! - a checkpoint is written under `Precondition::Absent` and never rewritten
//! - each checkpoint covers the inclusive key span `[first_key, last_processed_key]`

use crate::error::EngineError;
use crate::types::JobId;
use chrono::{DateTime, Utc};
use docshift_store::{
    CommitReceipt, DocKey, Document, DocumentStore, KeyRange, ShapeVersion, Transaction,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Prefix reserved for engine-owned collections
pub const ADMIN_PREFIX: &str = "_docshift_";
/// Job records
pub const JOBS_COLLECTION: &str = "_docshift_jobs";
/// Checkpoint ledger
pub const CHECKPOINTS_COLLECTION: &str = "_docshift_checkpoints";
/// Pre-migration snapshot
pub const BACKUPS_COLLECTION: &str = "_docshift_backups";
/// Rollback plans
pub const ROLLBACKS_COLLECTION: &str = "_docshift_rollbacks";

/// Shape of every admin record
pub const RECORD_SHAPE: ShapeVersion = ShapeVersion(1);

const LEDGER_PAGE: usize = 500;

/// Immutable progress record of one committed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    pub partition: usize,
    pub sequence_number: u64,
    /// First key the batch looked at
    pub first_key: DocKey,
    pub last_processed_key: DocKey,
    pub documents_migrated: usize,
    /// Failed documents recorded by this checkpoint, including those
    /// carried over from an exhausted batch
    pub documents_failed: usize,
    pub failed_keys: Vec<DocKey>,
    pub timestamp: DateTime<Utc>,
    pub batch_duration_ms: u64,
}

impl Checkpoint {
    /// Ledger key of this checkpoint
    #[must_use]
    pub fn record_key(&self) -> DocKey {
        checkpoint_key(self.job_id, self.partition, self.sequence_number)
    }

    /// Whether `key` lies inside the batch's span
    #[inline]
    #[must_use]
    pub fn spans(&self, key: &DocKey) -> bool {
        *key >= self.first_key && *key <= self.last_processed_key
    }
}

/// Ledger key for a checkpoint
#[must_use]
pub fn checkpoint_key(job_id: JobId, partition: usize, sequence: u64) -> DocKey {
    DocKey::new(format!("{job_id}/{partition:04}/{sequence:012}"))
}

/// Key range of every record a job owns in an admin collection
#[must_use]
pub fn job_prefix(job_id: JobId) -> KeyRange {
    KeyRange::prefix(&format!("{job_id}/"))
}

/// Wrap a serializable record as an admin document
///
/// # Errors
/// Returns `EngineError::Store` if the record cannot be encoded
pub fn encode_record<T: Serialize>(key: DocKey, record: &T) -> Result<Document, EngineError> {
    let body = serde_json::to_value(record).map_err(docshift_store::StoreError::from)?;
    Ok(Document::new(key, RECORD_SHAPE, body))
}

/// Decode an admin document
///
/// # Errors
/// Returns `EngineError::CorruptRecord` if the body does not match `T`
pub fn decode_record<T: DeserializeOwned>(doc: &Document) -> Result<T, EngineError> {
    serde_json::from_value(doc.body.clone()).map_err(|e| EngineError::CorruptRecord {
        key: doc.key.clone(),
        reason: e.to_string(),
    })
}

/// Read every admin record of a job, in key order
///
/// # Errors
/// Returns `EngineError` if the store fails or a record is corrupt
pub async fn load_job_records<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    job_id: JobId,
) -> Result<Vec<T>, EngineError> {
    let range = job_prefix(job_id);
    let mut out = Vec::new();
    let mut after: Option<DocKey> = None;
    loop {
        let page = store
            .scan(collection, &range, after.as_ref(), LEDGER_PAGE)
            .await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.key.clone());
        for doc in &page {
            out.push(decode_record(doc)?);
        }
        if page.len() < LEDGER_PAGE {
            break;
        }
    }
    Ok(out)
}

/// Append-only checkpoint writer for one job
#[derive(Debug)]
pub struct CheckpointStore {
    store: Arc<dyn DocumentStore>,
    job_id: JobId,
    next_sequence: AtomicU64,
}

impl CheckpointStore {
    /// Open the ledger of `job_id`, seeding the sequence counter from its tail
    ///
    /// # Errors
    /// Returns `EngineError` if the ledger cannot be read
    pub async fn open(store: Arc<dyn DocumentStore>, job_id: JobId) -> Result<Self, EngineError> {
        let tail = load_job_records::<Checkpoint>(store.as_ref(), CHECKPOINTS_COLLECTION, job_id)
            .await?
            .iter()
            .map(|c| c.sequence_number)
            .max()
            .unwrap_or(0);
        tracing::debug!(%job_id, tail, "opened checkpoint ledger");
        Ok(Self {
            store,
            job_id,
            next_sequence: AtomicU64::new(tail + 1),
        })
    }

    /// Job this ledger belongs to
    #[inline]
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Reserve the next sequence number
    #[inline]
    pub fn allocate(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Add `checkpoint` to a transaction, guarded against rewriting
    ///
    /// # Errors
    /// Returns `EngineError` if the checkpoint cannot be encoded
    pub fn stage(&self, txn: &mut Transaction, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let key = checkpoint.record_key();
        txn.expect_absent(CHECKPOINTS_COLLECTION, key.clone());
        txn.push_put(CHECKPOINTS_COLLECTION, encode_record(key, checkpoint)?);
        Ok(())
    }

    /// Append a checkpoint in its own single-document transaction
    ///
    /// # Errors
    /// Returns `EngineError::Store` if the commit fails
    pub async fn append(&self, checkpoint: &Checkpoint) -> Result<CommitReceipt, EngineError> {
        let mut txn = Transaction::new();
        self.stage(&mut txn, checkpoint)?;
        Ok(self.store.commit(txn).await?)
    }

    /// Current view of the ledger
    ///
    /// # Errors
    /// Returns `EngineError` if the store fails or a record is corrupt
    pub async fn ledger(&self) -> Result<LedgerView, EngineError> {
        LedgerView::load(self.store.as_ref(), self.job_id).await
    }
}

/// Merged, sequence-ordered view over all partitions of a job's ledger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerView {
    checkpoints: Vec<Checkpoint>,
}

impl LedgerView {
    /// Load the ledger of `job_id`
    ///
    /// # Errors
    /// Returns `EngineError` if the store fails or a record is corrupt
    pub async fn load(store: &dyn DocumentStore, job_id: JobId) -> Result<Self, EngineError> {
        let checkpoints = load_job_records(store, CHECKPOINTS_COLLECTION, job_id).await?;
        Ok(Self::from_checkpoints(checkpoints))
    }

    /// Build from checkpoints in any order
    #[must_use]
    pub fn from_checkpoints(mut checkpoints: Vec<Checkpoint>) -> Self {
        checkpoints.sort_by_key(|c| c.sequence_number);
        Self { checkpoints }
    }

    /// Add a checkpoint committed after the view was built
    pub fn insert(&mut self, checkpoint: Checkpoint) {
        let at = self
            .checkpoints
            .partition_point(|c| c.sequence_number < checkpoint.sequence_number);
        self.checkpoints.insert(at, checkpoint);
    }

    /// All checkpoints, oldest first
    #[inline]
    #[must_use]
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Highest-sequence checkpoint
    #[must_use]
    pub fn tail(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Highest-sequence checkpoint of one partition
    #[must_use]
    pub fn partition_tail(&self, partition: usize) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.partition == partition)
    }

    /// Tail of every partition that has progress
    #[must_use]
    pub fn partition_tails(&self) -> BTreeMap<usize, &Checkpoint> {
        let mut tails = BTreeMap::new();
        for checkpoint in &self.checkpoints {
            tails.insert(checkpoint.partition, checkpoint);
        }
        tails
    }

    /// Checkpoint with the given sequence number
    #[must_use]
    pub fn get(&self, sequence: u64) -> Option<&Checkpoint> {
        self.checkpoints
            .binary_search_by_key(&sequence, |c| c.sequence_number)
            .ok()
            .map(|i| &self.checkpoints[i])
    }

    /// Checkpoints after `sequence`, newest first
    pub fn after(&self, sequence: u64) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .take_while(move |c| c.sequence_number > sequence)
    }

    #[must_use]
    pub fn documents_migrated(&self) -> usize {
        self.checkpoints.iter().map(|c| c.documents_migrated).sum()
    }

    #[must_use]
    pub fn documents_failed(&self) -> usize {
        self.checkpoints.iter().map(|c| c.documents_failed).sum()
    }

    /// Keys of every document recorded as failed
    #[must_use]
    pub fn failed_keys(&self) -> BTreeSet<DocKey> {
        self.checkpoints
            .iter()
            .flat_map(|c| c.failed_keys.iter().cloned())
            .collect()
    }

    /// Whether `key` was migrated by a committed batch
    #[must_use]
    pub fn covers(&self, key: &DocKey) -> bool {
        let mut spanned = false;
        for checkpoint in &self.checkpoints {
            if checkpoint.failed_keys.contains(key) {
                return false;
            }
            spanned |= checkpoint.spans(key);
        }
        spanned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docshift_store::{MemoryStore, StoreError};

    fn checkpoint(job_id: JobId, partition: usize, seq: u64, first: &str, last: &str) -> Checkpoint {
        Checkpoint {
            job_id,
            partition,
            sequence_number: seq,
            first_key: DocKey::new(first),
            last_processed_key: DocKey::new(last),
            documents_migrated: 2,
            documents_failed: 0,
            failed_keys: Vec::new(),
            timestamp: Utc::now(),
            batch_duration_ms: 3,
        }
    }

    #[test]
    fn record_key_layout() {
        let job = JobId::new();
        let key = checkpoint_key(job, 3, 42);
        assert_eq!(key.as_str(), format!("{job}/0003/000000000042"));
        assert!(job_prefix(job).contains(&key));
        assert!(!job_prefix(JobId::new()).contains(&key));
    }

    #[tokio::test]
    async fn sequence_continues_from_ledger_tail() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let job = JobId::new();
        let ledger = CheckpointStore::open(store.clone(), job).await.unwrap();
        assert_eq!(ledger.allocate(), 1);
        let seq = ledger.allocate();
        ledger.append(&checkpoint(job, 0, seq, "a", "b")).await.unwrap();

        let reopened = CheckpointStore::open(store, job).await.unwrap();
        assert_eq!(reopened.allocate(), 3);
    }

    #[tokio::test]
    async fn checkpoints_are_never_rewritten() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let job = JobId::new();
        let ledger = CheckpointStore::open(store, job).await.unwrap();
        let cp = checkpoint(job, 0, 1, "a", "b");
        ledger.append(&cp).await.unwrap();
        let err = ledger.append(&cp).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn ledger_merges_partitions_in_sequence_order() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let job = JobId::new();
        let ledger = CheckpointStore::open(store, job).await.unwrap();
        ledger.append(&checkpoint(job, 1, 2, "m", "n")).await.unwrap();
        ledger.append(&checkpoint(job, 0, 1, "a", "b")).await.unwrap();
        ledger.append(&checkpoint(job, 0, 3, "c", "d")).await.unwrap();

        let view = ledger.ledger().await.unwrap();
        let seqs: Vec<u64> = view.checkpoints().iter().map(|c| c.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(view.tail().map(|c| c.sequence_number), Some(3));
        assert_eq!(view.partition_tail(0).map(|c| c.sequence_number), Some(3));
        assert_eq!(view.partition_tail(1).map(|c| c.sequence_number), Some(2));
        assert_eq!(view.documents_migrated(), 6);
        let newest_first: Vec<u64> = view.after(1).map(|c| c.sequence_number).collect();
        assert_eq!(newest_first, vec![3, 2]);
    }

    #[test]
    fn covers_spans_but_not_failed_keys() {
        let job = JobId::new();
        let mut cp = checkpoint(job, 0, 1, "doc-1", "doc-5");
        cp.failed_keys = vec![DocKey::new("doc-3")];
        let view = LedgerView::from_checkpoints(vec![cp]);
        assert!(view.covers(&DocKey::new("doc-1")));
        assert!(view.covers(&DocKey::new("doc-5")));
        assert!(!view.covers(&DocKey::new("doc-3")));
        assert!(!view.covers(&DocKey::new("doc-6")));
    }

    #[test]
    fn corrupt_record_is_reported() {
        let doc = Document::new("bad", RECORD_SHAPE, serde_json::json!({"nope": true}));
        let err = decode_record::<Checkpoint>(&doc).unwrap_err();
        assert!(matches!(err, EngineError::CorruptRecord { .. }));
    }
}
