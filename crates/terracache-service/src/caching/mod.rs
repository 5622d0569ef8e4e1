//! # Terracache Caching infrastructure
//!
//! Every result Terracache serves comes out of a remote computation that takes seconds to minutes
//! and is rate-limited. This module contains the tiered cache sitting in front of it.
//!
//! ## Cache Layers
//!
//! - An in-memory layer ([`moka`]) which holds the hot entries and does request coalescing
//!   (deduplicating concurrent misses on the same key).
//! - A file-system layer ([`DurableStore`]) which persists every successful computation, so that
//!   a restarted process can serve results right away.
//!
//! A lookup via [`CacheOrchestrator::get_or_compute`] goes through the following steps:
//! - First, it goes through the in-memory layer. A valid entry is returned without any I/O.
//! - On miss, it will try to load the entry from the file-system, if enabled, and promote a valid
//!   entry into memory.
//! - On miss, it will run the computation. The result is inserted into memory right away and
//!   written to the file-system in a background task.
//! - If the computation fails, an expired entry found in either layer is served as a stale
//!   fallback. Only when there is none the error is returned.
//!
//! Entries are never purged because they expired. They are only evicted from memory once the
//! configured capacity is exceeded, and from the file-system by the `cleanup` command.
//!
//! ### Metrics
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served by the in-memory layer.
//! - `caches.file.hit`: Lookups served by the file-system layer.
//! - `caches.computation`: Actual computations being run.
//! - `caches.stale`: Failed computations answered with a stale entry.
//! - `caches.file.write`: Entries written to the file-system, tagged by `status`.
//!
//! ### Configuration
//!
//! The file-system layer is gated by the [`Config::cache_dir`](crate::config::Config::cache_dir)
//! option. Without it, results only live in memory and are lost on restart.

mod cleanup;
mod clock;
mod durable;
mod entry;
mod error;
mod memory;
mod orchestrator;

pub use cleanup::{CleanupStats, cleanup};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use durable::{DurableStore, decode_file_name, file_name};
pub use entry::CacheEntry;
pub use error::ComputeError;
pub use orchestrator::{CacheOrchestrator, Lookup, Source};
