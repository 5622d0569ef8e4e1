use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{CacheEntry, ComputeError, Source};
use crate::types::CacheKey;

/// An item saved in the in-memory moka cache.
///
/// Besides valid entries, this also holds expired entries kept around as a stale fallback, and the
/// outcome of failed computations, so that coalesced callers all observe the same error.
#[derive(Clone, Debug)]
pub(super) struct MemoryItem {
    /// The entry, which might have expired already.
    pub entry: Option<Arc<CacheEntry>>,
    /// Where `entry` came from when this item was created.
    pub source: Source,
    /// The error of the computation that created this item, if it failed.
    pub error: Option<ComputeError>,
}

impl MemoryItem {
    pub fn new(entry: Arc<CacheEntry>, source: Source) -> Self {
        Self {
            entry: Some(entry),
            source,
            error: None,
        }
    }

    /// A failed computation that fell back to a stale entry.
    pub fn stale(entry: Arc<CacheEntry>, error: ComputeError) -> Self {
        Self {
            entry: Some(entry),
            source: Source::Stale,
            error: Some(error),
        }
    }

    /// A failed computation without anything to fall back to.
    pub fn failed(error: ComputeError) -> Self {
        Self {
            entry: None,
            source: Source::Computed,
            error: Some(error),
        }
    }

    /// The entry, if it is valid at `now`.
    pub fn valid_entry(&self, now: DateTime<Utc>) -> Option<&Arc<CacheEntry>> {
        self.entry.as_ref().filter(|entry| entry.is_valid_at(now))
    }
}

pub(super) type MemoryCache = moka::future::Cache<CacheKey, MemoryItem>;

pub(super) fn build(capacity: u64) -> MemoryCache {
    MemoryCache::builder()
        .max_capacity(capacity)
        .name("results")
        .build()
}
