use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::memory::{self, MemoryCache, MemoryItem};
use super::{CacheEntry, ComputeError, DurableStore, SharedClock};
use crate::types::CacheKey;

/// Where the entry of a [`Lookup`] was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A valid entry in the in-memory layer.
    Memory,
    /// A valid entry in the file-system layer.
    Durable,
    /// A fresh computation.
    Computed,
    /// An expired entry, served because the computation failed.
    Stale,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Memory => "memory",
            Source::Durable => "durable",
            Source::Computed => "computed",
            Source::Stale => "stale",
        }
    }
}

/// The result of a successful cache lookup.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub entry: Arc<CacheEntry>,
    pub source: Source,
}

impl Lookup {
    fn new(entry: Arc<CacheEntry>, source: Source) -> Self {
        Self { entry, source }
    }

    pub fn value(&self) -> &Value {
        &self.entry.value
    }

    /// How long the entry may still be considered current.
    ///
    /// Stale entries are not current at all.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        match self.source {
            Source::Stale => Duration::ZERO,
            _ => self.entry.remaining_ttl(now),
        }
    }
}

/// The tiered cache in front of all computations.
///
/// There is a single orchestrator per process. It is cheap to clone, all clones share the same
/// in-memory layer.
#[derive(Clone)]
pub struct CacheOrchestrator {
    memory: MemoryCache,
    durable: DurableStore,
    clock: SharedClock,
}

impl fmt::Debug for CacheOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOrchestrator")
            .field("in-memory items", &self.memory.entry_count())
            .field("durable", &self.durable)
            .field("clock", &self.clock)
            .finish()
    }
}

impl CacheOrchestrator {
    pub fn new(in_memory_capacity: u64, durable: DurableStore, clock: SharedClock) -> Self {
        Self {
            memory: memory::build(in_memory_capacity),
            durable,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    /// Returns the entry for `key`, computing it if necessary.
    ///
    /// This tries the following things in order:
    /// 1. Looks up a valid entry in memory.
    /// 2. Looks up a valid entry in the file-system layer, promoting it into memory.
    /// 3. Runs `compute`. A successful result expires `ttl` from now, is inserted into memory and
    ///    persisted in the background.
    ///
    /// Concurrent misses on the same key are coalesced, so `compute` runs at most once at a time
    /// per key. If the computation fails, an expired entry of either layer is returned as
    /// [`Source::Stale`]. Without one, the error is returned.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Lookup, ComputeError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value, ComputeError>> + Send,
    {
        metric!(counter("caches.access") += 1);
        let now = self.clock.now();

        let previous = self.memory.get(key).await;
        if let Some(entry) = previous.as_ref().and_then(|item| item.valid_entry(now)) {
            metric!(counter("caches.memory.hit") += 1);
            return Ok(Lookup::new(Arc::clone(entry), Source::Memory));
        }
        let previous = previous.and_then(|item| item.entry);

        let init = Box::pin(self.lookup_or_compute(key, ttl, compute, previous));
        let replace_if = |item: &MemoryItem| item.valid_entry(now).is_none();
        let entry = self
            .memory
            .entry_by_ref(key)
            .or_insert_with_if(init, replace_if)
            .await;

        let is_fresh = entry.is_fresh();
        let item = entry.into_value();
        if !is_fresh {
            // Some other caller filled this in the meantime.
            if let Some(entry) = item.valid_entry(now) {
                metric!(counter("caches.memory.hit") += 1);
                return Ok(Lookup::new(Arc::clone(entry), Source::Memory));
            }
        }

        match item {
            MemoryItem {
                entry: Some(entry),
                source,
                ..
            } => Ok(Lookup::new(entry, source)),
            MemoryItem { error, .. } => Err(error.unwrap_or(ComputeError::InternalError)),
        }
    }

    /// Recomputes the entry for `key` unconditionally.
    ///
    /// On failure, the previous entry is left untouched and the error is returned.
    pub async fn refresh<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Lookup, ComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ComputeError>>,
    {
        let entry = self.compute(key, ttl, compute).await?;
        self.memory
            .insert(
                key.clone(),
                MemoryItem::new(Arc::clone(&entry), Source::Computed),
            )
            .await;
        Ok(Lookup::new(entry, Source::Computed))
    }

    /// Returns a valid entry for `key` without ever computing it.
    ///
    /// An entry found in the file-system layer is promoted into memory.
    pub async fn peek(&self, key: &CacheKey) -> Option<Lookup> {
        let now = self.clock.now();

        if let Some(item) = self.memory.get(key).await {
            if let Some(entry) = item.valid_entry(now) {
                metric!(counter("caches.memory.hit") += 1);
                return Some(Lookup::new(Arc::clone(entry), Source::Memory));
            }
        }

        let entry = self.durable.load(key).await?;
        if !entry.is_valid_at(now) {
            return None;
        }
        metric!(counter("caches.file.hit") += 1);

        let entry = Arc::new(entry);
        self.memory
            .insert(
                key.clone(),
                MemoryItem::new(Arc::clone(&entry), Source::Durable),
            )
            .await;
        Some(Lookup::new(entry, Source::Durable))
    }

    /// Returns the most recent entry for `key` as a stale fallback, even if it expired.
    ///
    /// Both layers are consulted and the entry with the later expiry wins. Nothing is computed
    /// or promoted.
    pub async fn peek_stale(&self, key: &CacheKey) -> Option<Lookup> {
        let in_memory = self.memory.get(key).await.and_then(|item| item.entry);
        let on_disk = self.durable.load(key).await.map(Arc::new);

        let entry = match (in_memory, on_disk) {
            (Some(a), Some(b)) => Some(if a.expiry < b.expiry { b } else { a }),
            (a, b) => a.or(b),
        }?;
        metric!(counter("caches.stale") += 1, "kind" => "fallback");
        Some(Lookup::new(entry, Source::Stale))
    }

    /// Inserts entries recovered from the file-system layer into memory.
    ///
    /// Expired entries are inserted as well, to serve as a stale fallback.
    pub async fn populate(&self, entries: impl IntoIterator<Item = CacheEntry>) -> usize {
        let mut count = 0;
        for entry in entries {
            let key = entry.key.clone();
            self.memory
                .insert(key, MemoryItem::new(Arc::new(entry), Source::Durable))
                .await;
            count += 1;
        }
        metric!(gauge("caches.memory.populated") = count as u64);
        count
    }

    async fn lookup_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
        previous: Option<Arc<CacheEntry>>,
    ) -> MemoryItem
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ComputeError>>,
    {
        let mut stale = previous;
        if let Some(entry) = self.durable.load(key).await {
            if entry.is_valid_at(self.clock.now()) {
                metric!(counter("caches.file.hit") += 1);
                return MemoryItem::new(Arc::new(entry), Source::Durable);
            }
            if stale.as_ref().is_none_or(|stale| stale.expiry < entry.expiry) {
                stale = Some(Arc::new(entry));
            }
        }

        match self.compute(key, ttl, compute).await {
            Ok(entry) => MemoryItem::new(entry, Source::Computed),
            Err(error) => match stale {
                Some(entry) => {
                    metric!(counter("caches.stale") += 1, "kind" => error.kind());
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        key = %key,
                        expiry = %entry.expiry,
                        "Computation failed, serving stale entry",
                    );
                    MemoryItem::stale(entry, error)
                }
                None => MemoryItem::failed(error),
            },
        }
    }

    async fn compute<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Arc<CacheEntry>, ComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ComputeError>>,
    {
        metric!(counter("caches.computation") += 1);
        let value = compute().await?;

        let entry = Arc::new(CacheEntry::new(key.clone(), value, self.clock.now(), ttl));
        self.durable.spawn_save(Arc::clone(&entry));
        Ok(entry)
    }
}
