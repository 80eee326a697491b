//! In-process document store
//!
//! Backs tests and the file store. Supports fault injection (transient
//! failures, quota bursts, poisoned keys), artificial commit latency and
//! toggling reachability so that every engine failure path can be driven
//! deterministically.

use crate::document::{DocKey, Document, KeyRange};
use crate::error::StoreError;
use crate::store::{DocumentStore, ServiceInfo, StoreLimits};
use crate::transaction::{CommitReceipt, Precondition, Transaction, WriteOp};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Faults to inject into upcoming commits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail this many upcoming commits with a transient error
    pub transient_commits: u32,
    /// Fail this many upcoming commits with a quota error
    pub quota_commits: u32,
    /// Every commit writing one of these keys fails transiently
    pub poisoned_keys: BTreeSet<DocKey>,
}

impl FaultPlan {
    /// Create empty plan
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` commits transiently
    #[inline]
    #[must_use]
    pub fn fail_next_commits(mut self, n: u32) -> Self {
        self.transient_commits = n;
        self
    }

    /// Fail the next `n` commits with a quota burst
    #[inline]
    #[must_use]
    pub fn quota_next_commits(mut self, n: u32) -> Self {
        self.quota_commits = n;
        self
    }

    /// Fail every commit that writes `key`
    #[inline]
    #[must_use]
    pub fn poison(mut self, key: impl Into<DocKey>) -> Self {
        self.poisoned_keys.insert(key.into());
        self
    }
}

/// In-memory document store
#[derive(Debug)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<DocKey, Document>>>,
    indexes: DashMap<String, BTreeSet<String>>,
    services: RwLock<BTreeMap<String, String>>,
    limits: StoreLimits,
    revision: AtomicU64,
    commits: AtomicU64,
    reachable: AtomicBool,
    commit_latency: Mutex<Option<Duration>>,
    faults: Mutex<FaultPlan>,
}

impl MemoryStore {
    /// Create empty store with default limits
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(StoreLimits::default())
    }

    /// Create empty store with custom limits
    #[must_use]
    pub fn with_limits(limits: StoreLimits) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            indexes: DashMap::new(),
            services: RwLock::new(BTreeMap::new()),
            limits,
            revision: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            commit_latency: Mutex::new(None),
            faults: Mutex::new(FaultPlan::default()),
        }
    }

    /// Builder form of [`Self::add_index`]
    #[must_use]
    pub fn with_index(self, collection: &str, name: &str) -> Self {
        self.add_index(collection, name);
        self
    }

    /// Builder form of [`Self::set_service`]
    #[must_use]
    pub fn with_service(self, name: &str, version: &str) -> Self {
        self.set_service(name, version);
        self
    }

    /// Declare an index on a collection
    pub fn add_index(&self, collection: &str, name: &str) {
        self.indexes
            .entry(collection.to_string())
            .or_default()
            .insert(name.to_string());
    }

    /// Declare a dependent service version reported by `ping`
    pub fn set_service(&self, name: &str, version: &str) {
        self.services
            .write()
            .insert(name.to_string(), version.to_string());
    }

    /// Make the store (un)reachable
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every commit by `latency`
    pub fn set_commit_latency(&self, latency: Option<Duration>) {
        *self.commit_latency.lock() = latency;
    }

    /// Replace the fault plan
    pub fn inject_faults(&self, plan: FaultPlan) {
        *self.faults.lock() = plan;
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        *self.faults.lock() = FaultPlan::default();
    }

    /// Insert documents directly, bypassing limits and faults
    ///
    /// Each document receives a fresh revision.
    pub fn seed(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        let mut collections = self.collections.write();
        let target = collections.entry(collection.to_string()).or_default();
        for mut doc in documents {
            doc.revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            target.insert(doc.key.clone(), doc);
        }
    }

    /// Insert documents keeping their recorded revisions
    pub fn restore(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        let mut collections = self.collections.write();
        let target = collections.entry(collection.to_string()).or_default();
        for doc in documents {
            self.revision.fetch_max(doc.revision, Ordering::SeqCst);
            target.insert(doc.key.clone(), doc);
        }
    }

    /// Copy of every document in a collection, in key order
    #[must_use]
    pub fn snapshot(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of all non-empty collections
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Declared indexes per collection
    #[must_use]
    pub fn indexes(&self) -> BTreeMap<String, Vec<String>> {
        self.indexes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    /// Declared service versions
    #[must_use]
    pub fn services(&self) -> BTreeMap<String, String> {
        self.services.read().clone()
    }

    /// Number of successful commits so far
    #[inline]
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is not reachable".to_string()))
        }
    }

    fn take_injected_fault(&self, txn: &Transaction) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        if faults.quota_commits > 0 {
            faults.quota_commits -= 1;
            return Err(StoreError::QuotaExceeded("injected quota burst".to_string()));
        }
        if faults.transient_commits > 0 {
            faults.transient_commits -= 1;
            return Err(StoreError::Transient("injected transient failure".to_string()));
        }
        if let Some(op) = txn
            .ops()
            .iter()
            .find(|op| faults.poisoned_keys.contains(op.key()))
        {
            return Err(StoreError::Transient(format!(
                "write to poisoned key {}",
                op.key()
            )));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_precondition(
    collections: &HashMap<String, BTreeMap<DocKey, Document>>,
    precondition: &Precondition,
) -> Result<(), StoreError> {
    let (collection, key, holds) = match precondition {
        Precondition::RevisionIs {
            collection,
            key,
            revision,
        } => {
            let current = collections
                .get(collection)
                .and_then(|c| c.get(key))
                .map(|d| d.revision);
            (collection, key, current == Some(*revision))
        }
        Precondition::Absent { collection, key } => {
            let exists = collections
                .get(collection)
                .is_some_and(|c| c.contains_key(key));
            (collection, key, !exists)
        }
    };
    if holds {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            collection: collection.clone(),
            key: key.clone(),
        })
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    async fn ping(&self) -> Result<ServiceInfo, StoreError> {
        self.check_reachable()?;
        Ok(ServiceInfo {
            name: "docshift-memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            services: self.services(),
        })
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .indexes
            .get(collection)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, collection: &str, key: &DocKey) -> Result<Option<Document>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn scan(
        &self,
        collection: &str,
        range: &KeyRange,
        after: Option<&DocKey>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.check_reachable()?;
        let lower = match (after, &range.start) {
            (Some(a), Some(s)) if a < s => Bound::Included(s.clone()),
            (Some(a), _) => Bound::Excluded(a.clone()),
            (None, Some(s)) => Bound::Included(s.clone()),
            (None, None) => Bound::Unbounded,
        };
        if let (Bound::Included(low) | Bound::Excluded(low), Some(end)) = (&lower, &range.end) {
            if low >= end {
                return Ok(Vec::new());
            }
        }
        let upper = range.end.clone().map_or(Bound::Unbounded, Bound::Excluded);

        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .range((lower, upper))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn keys(&self, collection: &str) -> Result<Vec<DocKey>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.check_reachable()?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .map_or(0, BTreeMap::len))
    }

    async fn commit(&self, txn: Transaction) -> Result<CommitReceipt, StoreError> {
        self.check_reachable()?;
        let latency = *self.commit_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let ops = txn.op_count();
        if ops > self.limits.max_ops_per_transaction {
            return Err(StoreError::TransactionTooLarge {
                ops,
                limit: self.limits.max_ops_per_transaction,
            });
        }
        let bytes = txn.payload_bytes();
        if bytes > self.limits.max_request_bytes {
            return Err(StoreError::PayloadTooLarge {
                bytes,
                limit: self.limits.max_request_bytes,
            });
        }
        self.take_injected_fault(&txn)?;

        let (writes, preconditions) = txn.into_parts();
        let mut collections = self.collections.write();
        for precondition in &preconditions {
            check_precondition(&collections, precondition)?;
        }

        let write_count = writes.len();
        let mut last_revision = self.revision.load(Ordering::SeqCst);
        for op in writes {
            match op {
                WriteOp::Put {
                    collection,
                    mut document,
                } => {
                    last_revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
                    document.revision = last_revision;
                    collections
                        .entry(collection)
                        .or_default()
                        .insert(document.key.clone(), document);
                }
                WriteOp::Delete { collection, key } => {
                    if let Some(docs) = collections.get_mut(&collection) {
                        docs.remove(&key);
                    }
                }
            }
        }
        drop(collections);
        self.commits.fetch_add(1, Ordering::SeqCst);

        Ok(CommitReceipt {
            revision: last_revision,
            writes: write_count,
            committed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ShapeVersion;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(key: &str) -> Document {
        Document::new(key, ShapeVersion(1), json!({ "k": key }))
    }

    fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store.seed("c", (0..n).map(|i| doc(&format!("k{i:03}"))));
        store
    }

    #[tokio::test]
    async fn scan_respects_range_cursor_and_limit() {
        let store = seeded(10);
        let range = KeyRange::new(Some("k002".into()), Some("k008".into()));

        let first = store.scan("c", &range, None, 3).await.unwrap();
        let keys: Vec<_> = first.iter().map(|d| d.key.as_str().to_string()).collect();
        assert_eq!(keys, vec!["k002", "k003", "k004"]);

        let after = first.last().map(|d| d.key.clone());
        let second = store.scan("c", &range, after.as_ref(), 10).await.unwrap();
        let keys: Vec<_> = second.iter().map(|d| d.key.as_str().to_string()).collect();
        assert_eq!(keys, vec!["k005", "k006", "k007"]);
    }

    #[tokio::test]
    async fn scan_past_range_end_is_empty() {
        let store = seeded(10);
        let range = KeyRange::new(None, Some("k005".into()));
        let after = DocKey::new("k005");
        let docs = store.scan("c", &range, Some(&after), 10).await.unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn commit_is_atomic_on_conflict() {
        let store = seeded(2);
        let current = store.get("c", &"k000".into()).await.unwrap().unwrap();

        let mut txn = Transaction::new()
            .put("c", Document::new("k000", ShapeVersion(2), json!({})))
            .put("c", Document::new("k001", ShapeVersion(2), json!({})));
        txn.expect_revision("c", "k000".into(), current.revision + 100);

        let err = store.commit(txn).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let untouched = store.get("c", &"k001".into()).await.unwrap().unwrap();
        assert_eq!(untouched.shape, ShapeVersion(1));
    }

    #[tokio::test]
    async fn commit_rejects_oversized_transaction() {
        let store = MemoryStore::with_limits(StoreLimits {
            max_ops_per_transaction: 2,
            max_request_bytes: 1024,
        });
        let txn = Transaction::new()
            .put("c", doc("a"))
            .put("c", doc("b"))
            .put("c", doc("c"));

        let err = store.commit(txn).await.unwrap_err();
        assert_eq!(err, StoreError::TransactionTooLarge { ops: 3, limit: 2 });
        assert_eq!(store.count("c").await.unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_over_budget_transactions_write_nothing(
            puts in 1usize..40,
            reads in 0usize..40,
            max_ops in 1usize..60,
            max_bytes in 16usize..2_048,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let store = MemoryStore::with_limits(StoreLimits {
                max_ops_per_transaction: max_ops,
                max_request_bytes: max_bytes,
            });
            let mut txn = Transaction::new();
            txn.declare_reads(reads);
            for i in 0..puts {
                txn.push_put("c", doc(&format!("k{i:03}")));
            }
            let (ops, bytes) = (txn.op_count(), txn.payload_bytes());

            let result = rt.block_on(store.commit(txn));
            let stored = rt.block_on(store.count("c")).unwrap();
            if ops > max_ops || bytes > max_bytes {
                prop_assert!(result.is_err());
                prop_assert_eq!(stored, 0);
                prop_assert_eq!(store.commit_count(), 0);
            } else {
                prop_assert!(result.is_ok());
                prop_assert_eq!(stored, puts);
            }
        }
    }

    #[tokio::test]
    async fn revisions_increase_on_write() {
        let store = seeded(1);
        let before = store.get("c", &"k000".into()).await.unwrap().unwrap();
        store
            .commit(Transaction::new().put("c", doc("k000")))
            .await
            .unwrap();
        let after = store.get("c", &"k000".into()).await.unwrap().unwrap();
        assert!(after.revision > before.revision);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let store = MemoryStore::new();
        store.inject_faults(FaultPlan::new().fail_next_commits(1).quota_next_commits(1));

        let first = store.commit(Transaction::new().put("c", doc("a"))).await;
        assert!(matches!(first, Err(StoreError::QuotaExceeded(_))));
        let second = store.commit(Transaction::new().put("c", doc("a"))).await;
        assert!(matches!(second, Err(StoreError::Transient(_))));
        let third = store.commit(Transaction::new().put("c", doc("a"))).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn poisoned_key_always_fails() {
        let store = MemoryStore::new();
        store.inject_faults(FaultPlan::new().poison("bad"));
        for _ in 0..3 {
            let result = store.commit(Transaction::new().put("c", doc("bad"))).await;
            assert!(matches!(result, Err(StoreError::Transient(_))));
        }
        assert!(store.commit(Transaction::new().put("c", doc("ok"))).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_store_fails_everything() {
        let store = seeded(1);
        store.set_reachable(false);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(store.get("c", &"k000".into()).await.is_err());
        store.set_reachable(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn absent_precondition() {
        let store = seeded(1);
        let mut txn = Transaction::new().put("c", doc("k000"));
        txn.expect_absent("c", "k000".into());
        assert!(matches!(
            store.commit(txn).await,
            Err(StoreError::Conflict { .. })
        ));
    }
}
