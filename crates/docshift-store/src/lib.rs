//! docshift Store - Document store abstraction
//!
//! The migration engine treats the document store as an opaque service that
//! offers:
//! - Key-ordered scans over a collection
//! - Atomic multi-document transactions bounded by an operation ceiling
//! - Optimistic concurrency through per-document revisions
//! - Index and service metadata for readiness checks
//!
//! Two implementations ship with the crate: [`MemoryStore`] (in-process,
//! with fault injection for tests) and [`FileStore`] (JSON files on disk,
//! used by the operational CLI).
//!
//! # Example
//!
//! ```rust,ignore
//! use docshift_store::prelude::*;
//!
//! let store = MemoryStore::new();
//! let doc = Document::new("doc-1", ShapeVersion(1), serde_json::json!({"owner": "a"}));
//! store.commit(Transaction::new().put("trades", doc)).await?;
//! ```

#![allow(missing_docs)]

pub mod document;
pub mod error;
pub mod file;
pub mod memory;
pub mod store;
pub mod transaction;

pub use document::{DocKey, Document, KeyRange, ShapeVersion};
pub use error::StoreError;
pub use file::{FileStore, FileStoreManifest};
pub use memory::{FaultPlan, MemoryStore};
pub use store::{DocumentStore, ServiceInfo, StoreLimits};
pub use transaction::{CommitReceipt, Precondition, Transaction, WriteOp};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with docshift stores
    pub use crate::{
        CommitReceipt, DocKey, Document, DocumentStore, KeyRange, MemoryStore, ShapeVersion,
        StoreError, StoreLimits, Transaction,
    };
}
