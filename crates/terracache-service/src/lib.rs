//! The caching and precompute core of Terracache.
//!
//! Every operation exposed by Terracache is backed by a slow, rate-limited remote computation.
//! This crate contains everything needed to serve those results without hammering the upstream:
//! the [`retry`] executor around individual remote calls, the tiered [`caching`] layer, the
//! [`scheduler`] that keeps the well-known results warm, and the cache-first [`router`] that
//! decides how an incoming request is answered.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod services;
pub mod types;
pub mod upstream;
pub mod utils;
