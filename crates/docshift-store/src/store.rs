//! The document store trait

use crate::document::{DocKey, Document, KeyRange};
use crate::error::StoreError;
use crate::transaction::{CommitReceipt, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store-enforced request ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLimits {
    /// Maximum operations charged to one transaction
    pub max_ops_per_transaction: usize,
    /// Maximum written payload per request in bytes
    pub max_request_bytes: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_ops_per_transaction: 500,
            max_request_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Connectivity check answer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Store product name
    pub name: String,
    /// Store version
    pub version: String,
    /// Versions of dependent services reachable through the store
    pub services: BTreeMap<String, String>,
}

/// Document store operations used by the migration engine
///
/// Scans are ordered by key. `commit` is atomic: either every write and
/// precondition in the transaction holds, or nothing is applied.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + std::fmt::Debug {
    /// Request ceilings of this store
    fn limits(&self) -> StoreLimits;

    /// Connectivity check
    async fn ping(&self) -> Result<ServiceInfo, StoreError>;

    /// Names of the indexes defined on a collection
    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>, StoreError>;

    /// Fetch one document
    async fn get(&self, collection: &str, key: &DocKey) -> Result<Option<Document>, StoreError>;

    /// Fetch up to `limit` documents inside `range` with keys strictly
    /// greater than `after`, in key order
    async fn scan(
        &self,
        collection: &str,
        range: &KeyRange,
        after: Option<&DocKey>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    /// All keys of a collection, sorted
    async fn keys(&self, collection: &str) -> Result<Vec<DocKey>, StoreError>;

    /// Number of documents in a collection
    async fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// Apply a transaction atomically
    async fn commit(&self, txn: Transaction) -> Result<CommitReceipt, StoreError>;
}
