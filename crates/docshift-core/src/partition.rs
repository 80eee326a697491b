//! Static key-space partitioning
//!
//! Computed once at validation time from the sorted key list:
//! - keys are cut into batch-aligned blocks
//! - blocks are dealt contiguously to `min(concurrency, blocks)` partitions
//! - the first partition is unbounded below and the last unbounded above
//!
//! Boundaries are existing keys, so every partition except the last
//! holds a whole number of full batches.

use crate::types::Partition;
use docshift_store::{DocKey, KeyRange};

/// Split the ordered `keys` into disjoint partitions covering the key space
///
/// `keys` must be sorted ascending and free of duplicates.
#[must_use]
pub fn plan_partitions(keys: &[DocKey], batch_size: usize, concurrency: usize) -> Vec<Partition> {
    let batch_size = batch_size.max(1);
    let blocks = keys.len().div_ceil(batch_size);
    let count = concurrency.max(1).min(blocks.max(1));

    let base = blocks / count;
    let extra = blocks % count;

    let mut starts = Vec::with_capacity(count);
    let mut block = 0;
    for index in 0..count {
        starts.push(block * batch_size);
        block += base + usize::from(index < extra);
    }

    (0..count)
        .map(|index| {
            let first = starts[index];
            let next = starts.get(index + 1).copied();
            let start = (index > 0).then(|| keys[first].clone());
            let end = next.map(|n| keys[n].clone());
            let estimated_documents = next.unwrap_or(keys.len()) - first.min(keys.len());
            Partition {
                index,
                range: KeyRange::new(start, end),
                estimated_documents,
            }
        })
        .collect()
}

/// Index of the partition containing `key`
#[must_use]
pub fn partition_of(partitions: &[Partition], key: &DocKey) -> Option<usize> {
    partitions
        .iter()
        .find(|p| p.range.contains(key))
        .map(|p| p.index)
}
