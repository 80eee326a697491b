//! Error types for document store access

use crate::document::DocKey;

/// Store error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Transient failure (network blip, leader change)
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Request rate quota exhausted; retry later
    #[error("request quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Transaction has more operations than the store accepts
    #[error("transaction has {ops} operations, limit is {limit}")]
    TransactionTooLarge { ops: usize, limit: usize },

    /// Request payload exceeds the store's size limit
    #[error("request payload of {bytes} bytes exceeds limit of {limit}")]
    PayloadTooLarge { bytes: usize, limit: usize },

    /// Optimistic concurrency check failed
    #[error("write conflict on {collection}/{key}")]
    Conflict { collection: String, key: DocKey },

    /// Invalid collection name or request shape
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backing file I/O failed
    #[error("io error: {0}")]
    Io(String),
}

impl StoreError {
    /// Check if the failure is worth retrying
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Transient(_) | Self::QuotaExceeded(_) | Self::Conflict { .. }
        )
    }

    /// Check if the failure is a rate quota burst
    #[inline]
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
