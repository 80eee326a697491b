//! Per-transaction operation and payload budgets
//!
//! A batch transaction costs one read and one write per document, the
//! secondary index updates those writes cause, and one checkpoint write.
//! Exceeding the store ceiling fails the whole transaction, so configs that
//! could exceed it are rejected up front.

use crate::error::ConfigError;
use crate::types::JobConfig;
use docshift_store::StoreLimits;
use serde::{Deserialize, Serialize};

/// Reads per migrated document
pub const READS_PER_DOCUMENT: usize = 1;
/// Writes per migrated document
pub const WRITES_PER_DOCUMENT: usize = 1;
/// Checkpoint writes per batch transaction
pub const CHECKPOINT_WRITES: usize = 1;

/// Validated budget for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBudget {
    pub batch_size: usize,
    /// Worst-case operations of one batch transaction
    pub ops_per_batch: usize,
    /// Estimated payload of one batch transaction
    pub payload_per_batch: usize,
    /// Effective operation ceiling (store limit or configured quota, whichever is lower)
    pub op_limit: usize,
    pub payload_limit: usize,
    pub index_updates_per_document: usize,
}

impl OperationBudget {
    /// Operations needed by a batch of `batch_size` documents
    #[inline]
    #[must_use]
    pub fn ops_for(batch_size: usize, index_updates_per_document: usize) -> usize {
        batch_size
            .saturating_mul(READS_PER_DOCUMENT + WRITES_PER_DOCUMENT + index_updates_per_document)
            .saturating_add(CHECKPOINT_WRITES)
    }

    /// Effective operation ceiling for `config` against `limits`
    #[inline]
    #[must_use]
    pub fn op_limit(config: &JobConfig, limits: &StoreLimits) -> usize {
        config
            .quota_ceiling
            .map_or(limits.max_ops_per_transaction, |q| {
                q.min(limits.max_ops_per_transaction)
            })
    }

    /// Largest batch size that fits the operation ceiling
    #[must_use]
    pub fn max_batch_size(config: &JobConfig, limits: &StoreLimits) -> usize {
        let per_doc =
            READS_PER_DOCUMENT + WRITES_PER_DOCUMENT + config.index_updates_per_document;
        Self::op_limit(config, limits).saturating_sub(CHECKPOINT_WRITES) / per_doc
    }

    /// Compute and check the budget
    ///
    /// # Errors
    /// - `ConfigError::OperationBudgetExceeded` if a full batch exceeds the op ceiling
    /// - `ConfigError::PayloadBudgetExceeded` if a full batch exceeds the request size
    pub fn for_config(config: &JobConfig, limits: &StoreLimits) -> Result<Self, ConfigError> {
        let op_limit = Self::op_limit(config, limits);
        let ops_per_batch = Self::ops_for(config.batch_size, config.index_updates_per_document);
        if ops_per_batch > op_limit {
            return Err(ConfigError::OperationBudgetExceeded {
                ops: ops_per_batch,
                limit: op_limit,
            });
        }
        let payload_per_batch = config
            .batch_size
            .saturating_mul(config.estimated_document_bytes);
        if payload_per_batch > limits.max_request_bytes {
            return Err(ConfigError::PayloadBudgetExceeded {
                bytes: payload_per_batch,
                limit: limits.max_request_bytes,
            });
        }
        Ok(Self {
            batch_size: config.batch_size,
            ops_per_batch,
            payload_per_batch,
            op_limit,
            payload_limit: limits.max_request_bytes,
            index_updates_per_document: config.index_updates_per_document,
        })
    }

    /// Documents per rollback transaction
    ///
    /// A revert costs the same per document as a forward write but needs no
    /// checkpoint, so the batch size always fits.
    #[inline]
    #[must_use]
    pub fn rollback_chunk(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Documents per backup-restore transaction
    ///
    /// Restoring reads the backup record and the live document before
    /// writing, one more read than a forward write.
    #[must_use]
    pub fn restore_chunk(&self) -> usize {
        let per_doc =
            READS_PER_DOCUMENT * 2 + WRITES_PER_DOCUMENT + self.index_updates_per_document;
        (self.op_limit / per_doc).clamp(1, self.batch_size.max(1))
    }

    /// Documents per snapshot transaction (one backup write each)
    ///
    /// Capped at the batch size, whose payload was checked against the
    /// request limit. [`Self::split_by_payload`] still bounds every request
    /// by the measured size.
    #[must_use]
    pub fn snapshot_chunk(&self) -> usize {
        (self.op_limit / (READS_PER_DOCUMENT + WRITES_PER_DOCUMENT)).clamp(1, self.batch_size.max(1))
    }

    /// Split `items` into runs that each fit one request
    ///
    /// A run holds at most `max_items` items whose `size` sums to no more
    /// than the payload limit. An item over the limit on its own gets a run
    /// of one, which the store then rejects.
    pub fn split_by_payload<'a, T>(
        &self,
        items: &'a [T],
        max_items: usize,
        size: impl Fn(&T) -> usize,
    ) -> Vec<&'a [T]> {
        let max_items = max_items.max(1);
        let mut runs = Vec::new();
        let mut start = 0;
        let mut bytes = 0usize;
        for (i, item) in items.iter().enumerate() {
            let len = size(item);
            if i > start && (i - start == max_items || bytes.saturating_add(len) > self.payload_limit) {
                runs.push(&items[start..i]);
                start = i;
                bytes = 0;
            }
            bytes = bytes.saturating_add(len);
        }
        if start < items.len() {
            runs.push(&items[start..]);
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_config_fits_default_limits() {
        let budget =
            OperationBudget::for_config(&JobConfig::default(), &StoreLimits::default()).unwrap();
        assert_eq!(budget.ops_per_batch, 401);
        assert_eq!(budget.op_limit, 500);
    }

    #[test]
    fn index_updates_count_against_the_ceiling() {
        let mut config = JobConfig::default().with_batch_size(200);
        config.index_updates_per_document = 1;
        let err = OperationBudget::for_config(&config, &StoreLimits::default()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::OperationBudgetExceeded {
                ops: 601,
                limit: 500
            }
        );
        assert_eq!(
            OperationBudget::max_batch_size(&config, &StoreLimits::default()),
            166
        );
    }

    #[test]
    fn quota_ceiling_lowers_the_limit() {
        let mut config = JobConfig::default().with_batch_size(100);
        config.quota_ceiling = Some(150);
        assert!(matches!(
            OperationBudget::for_config(&config, &StoreLimits::default()),
            Err(ConfigError::OperationBudgetExceeded { limit: 150, .. })
        ));
    }

    #[test]
    fn payload_budget_is_enforced() {
        let mut config = JobConfig::default().with_batch_size(100);
        config.estimated_document_bytes = 1024 * 1024;
        assert!(matches!(
            OperationBudget::for_config(&config, &StoreLimits::default()),
            Err(ConfigError::PayloadBudgetExceeded { .. })
        ));
    }

    #[test]
    fn restore_chunk_fits_ceiling() {
        let budget =
            OperationBudget::for_config(&JobConfig::default(), &StoreLimits::default()).unwrap();
        let chunk = budget.restore_chunk();
        assert!(chunk * 3 <= budget.op_limit);
        assert!(chunk >= 1);
    }

    #[test]
    fn snapshot_chunk_never_exceeds_batch_size() {
        let mut config = JobConfig::default().with_batch_size(200);
        config.estimated_document_bytes = 50_000;
        let budget = OperationBudget::for_config(&config, &StoreLimits::default()).unwrap();
        assert_eq!(budget.snapshot_chunk(), 200);

        let small = JobConfig::default().with_batch_size(20);
        let budget = OperationBudget::for_config(&small, &StoreLimits::default()).unwrap();
        assert_eq!(budget.snapshot_chunk(), 20);
    }

    #[test]
    fn runs_split_on_payload_and_count() {
        let limits = StoreLimits {
            max_request_bytes: 100,
            ..StoreLimits::default()
        };
        let config = JobConfig::default().with_batch_size(2);
        let budget = OperationBudget::for_config(&config, &StoreLimits::default()).unwrap();
        let budget = OperationBudget {
            payload_limit: limits.max_request_bytes,
            ..budget
        };

        let sizes = [40usize, 40, 40, 90, 150, 10, 10, 10];
        let runs = budget.split_by_payload(&sizes, 3, |s| *s);
        let runs: Vec<Vec<usize>> = runs.iter().map(|r| r.to_vec()).collect();
        assert_eq!(
            runs,
            vec![vec![40, 40], vec![40], vec![90], vec![150], vec![10, 10, 10]]
        );
        assert!(budget.split_by_payload(&[] as &[usize], 3, |s| *s).is_empty());
    }

    proptest! {
        #[test]
        fn prop_runs_cover_items_within_limits(
            sizes in proptest::collection::vec(1usize..400, 0..200),
            max_items in 1usize..50,
            payload_limit in 1usize..2_000,
        ) {
            let budget = OperationBudget {
                payload_limit,
                ..OperationBudget::for_config(&JobConfig::default(), &StoreLimits::default()).unwrap()
            };
            let runs = budget.split_by_payload(&sizes, max_items, |s| *s);
            let flat: Vec<usize> = runs.iter().flat_map(|r| r.iter().copied()).collect();
            prop_assert_eq!(&flat, &sizes);
            for run in &runs {
                prop_assert!(!run.is_empty());
                prop_assert!(run.len() <= max_items);
                let bytes: usize = run.iter().sum();
                prop_assert!(run.len() == 1 || bytes <= payload_limit);
            }
        }

        #[test]
        fn prop_accepted_budgets_never_exceed_the_ceiling(
            batch_size in 1usize..=10_000,
            index_updates in 0usize..8,
            doc_bytes in 1usize..200_000,
            max_ops in 10usize..2_000,
        ) {
            let mut config = JobConfig::default().with_batch_size(batch_size);
            config.index_updates_per_document = index_updates;
            config.estimated_document_bytes = doc_bytes;
            let limits = StoreLimits { max_ops_per_transaction: max_ops, ..StoreLimits::default() };

            match OperationBudget::for_config(&config, &limits) {
                Ok(budget) => {
                    prop_assert!(budget.ops_per_batch <= max_ops);
                    prop_assert!(budget.payload_per_batch <= limits.max_request_bytes);
                    prop_assert!(batch_size <= OperationBudget::max_batch_size(&config, &limits));
                }
                Err(ConfigError::OperationBudgetExceeded { ops, limit }) => {
                    prop_assert!(ops > limit);
                    prop_assert!(batch_size > OperationBudget::max_batch_size(&config, &limits));
                }
                Err(ConfigError::PayloadBudgetExceeded { bytes, limit }) => {
                    prop_assert!(bytes > limit);
                }
                Err(other) => prop_assert!(false, "unexpected error {other:?}"),
            }
        }
    }
}
