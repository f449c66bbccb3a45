//! Policies deciding which cache entries to evict.

use super::ResourceClass;
use super::blob_id::BlobId;
use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A cache entry that may be evicted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub class: ResourceClass,
    pub key: String,
    /// Size of the payload in bytes.
    pub size: u64,
    pub latest_access: DateTime<Utc>,
    pub(crate) blob_id: BlobId,
}

/// Facts about the environment an [EvictionPolicy] may base its decision on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvictionContext {
    pub now: DateTime<Utc>,
    /// Free space on the file system holding the cache, if it could be determined.
    pub available_space: Option<u64>,
}

/// Decides which entries to remove from the cache.
pub trait EvictionPolicy {
    /// Returns the candidates to evict.
    fn select(
        &self,
        candidates: Vec<EvictionCandidate>,
        context: &EvictionContext,
    ) -> Vec<EvictionCandidate>;
}

/// Whether `fraction` is a valid [LruPolicy::max_fraction_of_free], i.e. within 0 and 1.
pub fn is_valid_fraction(fraction: f64) -> bool {
    (0.0..=1.0).contains(&fraction)
}

/// Evicts the least recently accessed entries.
///
/// Entries not accessed within `max_unused_age` are removed. Then, entries are removed in order of
/// their latest access until the total payload size is within `max_size` and within
/// `max_fraction_of_free` of the available disk space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LruPolicy {
    pub max_unused_age: Option<TimeDelta>,
    pub max_size: Option<u64>,
    pub max_fraction_of_free: Option<f64>,
}

impl LruPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_unused_age.is_none() && self.max_size.is_none() && self.max_fraction_of_free.is_none()
    }

    /// Fractions outside of 0 to 1 are clamped. NaN imposes no limit.
    fn size_limit(&self, context: &EvictionContext) -> u64 {
        let fraction_limit = self
            .max_fraction_of_free
            .filter(|fraction| !fraction.is_nan())
            .zip(context.available_space)
            .map(|(fraction, available)| (fraction.clamp(0.0, 1.0) * available as f64) as u64);
        [self.max_size, fraction_limit]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(u64::MAX)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Queued {
    latest_access: Reverse<DateTime<Utc>>,
    size: u64,
    index: usize,
}

impl EvictionPolicy for LruPolicy {
    fn select(
        &self,
        candidates: Vec<EvictionCandidate>,
        context: &EvictionContext,
    ) -> Vec<EvictionCandidate> {
        if self.is_unbounded() {
            return vec![];
        }

        let size_limit = self.size_limit(context);
        let cutoff = self
            .max_unused_age
            .and_then(|max_unused_age| context.now.checked_sub_signed(max_unused_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut size_sum: u64 = candidates.iter().map(|candidate| candidate.size).sum();
        let mut heap: BinaryHeap<Queued> = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| Queued {
                latest_access: Reverse(candidate.latest_access),
                size: candidate.size,
                index,
            })
            .collect();

        let mut selected = vec![];
        while let Some(Queued {
            latest_access: Reverse(latest_access),
            ..
        }) = heap.peek()
        {
            if *latest_access >= cutoff && size_sum <= size_limit {
                break;
            }
            if let Some(Queued { size, index, .. }) = heap.pop() {
                selected.push(index);
                size_sum = size_sum.saturating_sub(size);
            }
        }

        let mut candidates: Vec<Option<EvictionCandidate>> =
            candidates.into_iter().map(Some).collect();
        selected
            .into_iter()
            .filter_map(|index| candidates[index].take())
            .collect()
    }
}
