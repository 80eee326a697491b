//! Atomic multi-document transactions
//!
//! A [`Transaction`] is applied all-or-nothing. The operation count the
//! store charges against its per-transaction ceiling is
//! `declared reads + writes + declared index updates`.

use crate::document::{DocKey, Document};
use chrono::{DateTime, Utc};

/// A single write inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace a document
    Put {
        collection: String,
        document: Document,
    },
    /// Remove a document (no-op if absent)
    Delete { collection: String, key: DocKey },
}

impl WriteOp {
    /// Collection the write targets
    #[inline]
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Put { collection, .. } | Self::Delete { collection, .. } => collection,
        }
    }

    /// Key the write targets
    #[inline]
    #[must_use]
    pub fn key(&self) -> &DocKey {
        match self {
            Self::Put { document, .. } => &document.key,
            Self::Delete { key, .. } => key,
        }
    }
}

/// Condition checked atomically before any write is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Document must exist with exactly this revision
    RevisionIs {
        collection: String,
        key: DocKey,
        revision: u64,
    },
    /// Document must not exist
    Absent { collection: String, key: DocKey },
}

/// Atomic unit of work
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<WriteOp>,
    preconditions: Vec<Precondition>,
    declared_reads: usize,
    index_updates: usize,
}

impl Transaction {
    /// Create empty transaction
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a put
    #[must_use]
    pub fn put(mut self, collection: impl Into<String>, document: Document) -> Self {
        self.push_put(collection, document);
        self
    }

    /// Add a put in place
    pub fn push_put(&mut self, collection: impl Into<String>, document: Document) {
        self.ops.push(WriteOp::Put {
            collection: collection.into(),
            document,
        });
    }

    /// Add a delete in place
    pub fn push_delete(&mut self, collection: impl Into<String>, key: DocKey) {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            key,
        });
    }

    /// Require a document revision
    pub fn expect_revision(&mut self, collection: impl Into<String>, key: DocKey, revision: u64) {
        self.preconditions.push(Precondition::RevisionIs {
            collection: collection.into(),
            key,
            revision,
        });
    }

    /// Require a document to be absent
    pub fn expect_absent(&mut self, collection: impl Into<String>, key: DocKey) {
        self.preconditions.push(Precondition::Absent {
            collection: collection.into(),
            key,
        });
    }

    /// Charge reads performed on behalf of this transaction
    pub fn declare_reads(&mut self, reads: usize) {
        self.declared_reads += reads;
    }

    /// Charge secondary index maintenance caused by the writes
    pub fn declare_index_updates(&mut self, updates: usize) {
        self.index_updates += updates;
    }

    /// Operations charged against the store ceiling
    #[inline]
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.declared_reads + self.ops.len() + self.index_updates
    }

    /// Encoded size of all written documents
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                WriteOp::Put { document, .. } => document.encoded_len(),
                WriteOp::Delete { key, .. } => key.as_str().len(),
            })
            .sum()
    }

    /// Writes in order
    #[inline]
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Preconditions in order
    #[inline]
    #[must_use]
    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    /// Check if the transaction writes nothing
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Collections touched by the writes, deduplicated
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.iter().map(|op| op.collection().to_string()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Split into writes and preconditions
    #[must_use]
    pub fn into_parts(self) -> (Vec<WriteOp>, Vec<Precondition>) {
        (self.ops, self.preconditions)
    }
}

/// Receipt returned by a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Store revision of the last write in the transaction
    pub revision: u64,
    /// Number of writes applied
    pub writes: usize,
    /// Commit time
    pub committed_at: DateTime<Utc>,
}
