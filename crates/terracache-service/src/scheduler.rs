//! Background precomputation of the registered operations.
//!
//! The [`Scheduler`] keeps the default parameterization of every operation in the [`Registry`]
//! warm, so that typical requests are served from the cache. A run refreshes all entries one
//! after another, with a pause in between to spare the rate-limited upstream. Runs happen once
//! shortly after startup, once a day at a configured time, and whenever an administrator asks
//! for one.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, TimeDelta, Utc};
use tokio::task::JoinHandle;

use crate::caching::CacheOrchestrator;
use crate::config::SchedulerConfig;
use crate::types::{CacheKey, Operation, Params};
use crate::upstream::{ComputeFn, ComputeService};
use crate::utils::futures::{m, measure};

/// One precomputed operation.
#[derive(Clone)]
pub struct RegistryEntry {
    /// The canonical key of the default parameterization.
    pub key: CacheKey,
    pub operation: Operation,
    pub compute: ComputeFn,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("key", &self.key)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

/// The fixed list of operations, in the order they are precomputed.
///
/// The registry is built once at startup and never changes afterwards.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    entries: Arc<[RegistryEntry]>,
}

impl Registry {
    pub fn new(entries: Vec<RegistryEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Registers every operation with its default parameters.
    pub fn from_operations(operations: &[Operation], compute: &ComputeService) -> Self {
        let entries = operations
            .iter()
            .map(|operation| RegistryEntry {
                key: operation.default_key(),
                operation: operation.clone(),
                compute: compute.compute_fn(operation.query(&Params::new())),
            })
            .collect();
        Self::new(entries)
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The outcome of one run over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
}

struct SchedulerInner {
    registry: Registry,
    orchestrator: CacheOrchestrator,
    config: SchedulerConfig,
    scheduled_ttl: Duration,
    running: AtomicUsize,
}

/// Refreshes all entries of a [`Registry`] in the [`CacheOrchestrator`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.inner.registry.len())
            .field("config", &self.inner.config)
            .field("running", &self.running())
            .finish()
    }
}

/// Tracks a run in progress.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(
        registry: Registry,
        orchestrator: CacheOrchestrator,
        config: SchedulerConfig,
        scheduled_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                orchestrator,
                config,
                scheduled_ttl,
                running: AtomicUsize::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The number of runs currently in progress.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Refreshes every registry entry, strictly in order and one at a time.
    ///
    /// A failing entry is logged and does not stop the run. Running this concurrently with
    /// another run is possible, but doubles the load on the upstream.
    pub async fn run_all(&self) -> RunSummary {
        measure("scheduler.run", m::ok, self.run_all_inner()).await
    }

    async fn run_all_inner(&self) -> RunSummary {
        let inner = &*self.inner;
        let running = inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = RunningGuard(&inner.running);
        if running > 1 {
            tracing::warn!(running, "Starting precompute run while another run is in progress");
        }

        tracing::info!(entries = inner.registry.len(), "Starting precompute run");
        let mut summary = RunSummary::default();

        for (index, entry) in inner.registry.entries().iter().enumerate() {
            if index > 0 && !inner.config.pacing_delay.is_zero() {
                tokio::time::sleep(inner.config.pacing_delay).await;
            }

            let result = inner
                .orchestrator
                .refresh(&entry.key, inner.scheduled_ttl, || (entry.compute)())
                .await;

            match result {
                Ok(lookup) => {
                    summary.succeeded += 1;
                    tracing::debug!(key = %entry.key, expiry = %lookup.entry.expiry, "Precomputed entry");
                }
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        key = %entry.key,
                        "Failed to precompute entry",
                    );
                }
            }
        }

        metric!(counter("scheduler.entries") += summary.succeeded as i64, "status" => "ok");
        metric!(counter("scheduler.entries") += summary.failed as i64, "status" => "err");
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Finished precompute run",
        );
        summary
    }

    /// Starts a run in the background.
    pub fn trigger(&self) -> JoinHandle<RunSummary> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_all().await })
    }

    /// Spawns the task running the registry after the startup delay and then daily.
    ///
    /// Returns `None` if the scheduler is disabled.
    pub fn spawn(&self) -> Option<JoinHandle<()>> {
        let config = self.inner.config;
        if !config.enabled {
            tracing::info!("Precompute scheduler is disabled");
            return None;
        }

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(config.startup_delay).await;
            scheduler.run_all().await;

            loop {
                let now = scheduler.inner.orchestrator.now();
                let next = next_run_after(now, config.daily_at, config.utc_offset);
                tracing::info!(next = %next, "Scheduled next precompute run");

                tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;
                scheduler.run_all().await;
            }
        });
        Some(handle)
    }
}

/// Returns the first occurrence of `time` in the timezone `offset` strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, time: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local_date = now.with_timezone(&offset).date_naive();
    let offset = TimeDelta::seconds(offset.local_minus_utc().into());
    let today = local_date.and_time(time).and_utc() - offset;

    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::caching::{ComputeError, DurableStore, ManualClock};
    use crate::upstream::ComputeFuture;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn offset(spec: &str) -> FixedOffset {
        spec.parse().unwrap()
    }

    #[test]
    fn test_next_run_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let next = next_run_after(now, time(18, 0), offset("+05:30"));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn test_next_run_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let next = next_run_after(now, time(3, 0), offset("+05:30"));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 21, 30, 0).unwrap());
    }

    #[test]
    fn test_next_run_is_strictly_after() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
        let next = next_run_after(now, time(3, 0), offset("+00:00"));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_across_date_line() {
        // 23:00 UTC is already the next day in UTC+05:30
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        let next = next_run_after(now, time(6, 0), offset("+05:30"));
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 30, 0).unwrap());

        let next = next_run_after(now, time(20, 0), offset("-05:00"));
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap());
    }

    fn entry(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> RegistryEntry {
        let operation = Operation {
            name: name.into(),
            route: None,
            params: Params::new(),
        };
        let log = Arc::clone(log);
        let name = name.to_owned();
        let runs = Arc::new(AtomicUsize::new(0));
        let compute: ComputeFn = Arc::new(move || -> ComputeFuture {
            let log = Arc::clone(&log);
            let name = name.clone();
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                log.lock().unwrap().push(name.clone());
                if fail {
                    Err(ComputeError::Upstream("quota exceeded".into()))
                } else {
                    Ok(json!({"name": name, "run": run}))
                }
            })
        });

        RegistryEntry {
            key: operation.default_key(),
            operation,
            compute,
        }
    }

    fn scheduler(registry: Registry, pacing_delay: Duration) -> Scheduler {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let orchestrator = CacheOrchestrator::new(100, DurableStore::disabled(), Arc::new(clock));
        let config = SchedulerConfig {
            pacing_delay,
            ..Default::default()
        };
        Scheduler::new(registry, orchestrator, config, Duration::from_secs(3600))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated() {
        terracache_test::setup();
        let log = Arc::default();
        let registry = Registry::new(vec![
            entry("first", &log, false),
            entry("second", &log, true),
            entry("third", &log, false),
        ]);
        let scheduler = scheduler(registry, Duration::from_secs(5));

        let start = Instant::now();
        let summary = scheduler.run_all().await;

        assert_eq!(
            summary,
            RunSummary {
                succeeded: 2,
                failed: 1
            }
        );
        assert_eq!(*log.lock().unwrap(), ["first", "second", "third"]);
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        let orchestrator = &scheduler.inner.orchestrator;
        let first = orchestrator.peek(&CacheKey::from_raw("first")).await.unwrap();
        assert_eq!(first.value(), &json!({"name": "first", "run": 1}));
        assert!(orchestrator.peek(&CacheKey::from_raw("second")).await.is_none());
        assert!(orchestrator.peek(&CacheKey::from_raw("third")).await.is_some());
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_are_idempotent() {
        let log = Arc::default();
        let registry = Registry::new(vec![entry("first", &log, false)]);
        let scheduler = scheduler(registry, Duration::ZERO);

        scheduler.run_all().await;
        scheduler.run_all().await;

        let orchestrator = &scheduler.inner.orchestrator;
        let first = orchestrator.peek(&CacheKey::from_raw("first")).await.unwrap();
        assert_eq!(first.value(), &json!({"name": "first", "run": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers() {
        let log = Arc::default();
        let registry = Registry::new(vec![entry("first", &log, false), entry("second", &log, false)]);
        let scheduler = scheduler(registry, Duration::from_secs(1));

        let a = scheduler.trigger();
        let b = scheduler.trigger();
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.succeeded, 2);
        assert_eq!(b.succeeded, 2);
        assert_eq!(log.lock().unwrap().len(), 4);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test]
    async fn test_disabled() {
        let registry = Registry::default();
        let clock = ManualClock::new(Utc::now());
        let orchestrator = CacheOrchestrator::new(100, DurableStore::disabled(), Arc::new(clock));
        let config = SchedulerConfig {
            enabled: false,
            ..Default::default()
        };
        let scheduler = Scheduler::new(registry, orchestrator, config, Duration::from_secs(60));

        assert!(scheduler.spawn().is_none());
        assert_eq!(scheduler.run_all().await, RunSummary::default());
    }
}
