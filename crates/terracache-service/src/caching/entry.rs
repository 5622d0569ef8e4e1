use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::CacheKey;

/// A computed result together with its absolute expiration time.
///
/// Entries are immutable. A recomputation replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub expiry: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates an entry that expires `ttl` after `now`.
    pub fn new(key: CacheKey, value: Value, now: DateTime<Utc>, ttl: Duration) -> Self {
        let expiry = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { key, value, expiry }
    }

    /// An entry is valid strictly before its expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }

    /// The time left until this entry expires, zero once it did.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expiry - now).to_std().unwrap_or_default()
    }
}
