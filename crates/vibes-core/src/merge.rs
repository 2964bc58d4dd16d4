//! Merge/dedup of freshly produced records into the persisted dataset.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::Keyed;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Records whose id was not in the dataset yet.
    pub appended: usize,
    /// Records that superseded an existing entry.
    pub replaced: usize,
}

/// Fold `batch` into `existing`, keyed by [`Keyed::key`].
///
/// Existing ids are replaced in place and keep their position; new ids are
/// appended in batch order. If the batch itself repeats an id, the last
/// occurrence wins and takes the slot of the first.
pub fn merge<T: Keyed + Clone>(existing: &[T], batch: &[T]) -> (Vec<T>, MergeStats) {
    let mut merged: Vec<T> = existing.to_vec();
    let mut index: HashMap<String, usize> = HashMap::with_capacity(merged.len() + batch.len());
    for (pos, record) in merged.iter().enumerate() {
        index.insert(record.key().to_string(), pos);
    }

    let mut stats = MergeStats::default();
    let base_len = merged.len();
    for record in batch {
        match index.get(record.key()) {
            Some(&pos) => {
                if pos < base_len {
                    stats.replaced += 1;
                }
                merged[pos] = record.clone();
            }
            None => {
                index.insert(record.key().to_string(), merged.len());
                merged.push(record.clone());
                stats.appended += 1;
            }
        }
    }

    (merged, stats)
}
