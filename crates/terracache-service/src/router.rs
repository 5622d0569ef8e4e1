//! Deciding how a request for an operation is answered.
//!
//! The [`CacheFirstRouter`] prefers anything already cached over computing. A request is looked
//! up under its exact key first. If it only asks for default parameters, the precomputed entry
//! of the default parameterization is used next. Only when both miss is the result computed on
//! demand, with the short on-demand TTL.

use std::time::Duration;

use serde_json::Value;

use crate::caching::{CacheOrchestrator, ComputeError, Lookup, Source};
use crate::types::{CacheKey, Operation, Params};
use crate::upstream::ComputeService;

/// How a request was served, reported in the `X-Cache` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// A valid entry under the exact key.
    Hit,
    /// The precomputed entry of the default parameters.
    DefaultHit,
    /// Computed on demand.
    Miss,
    /// An expired entry, served because computing failed.
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::DefaultHit => "default-hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Stale => "stale",
        }
    }
}

/// A cache-served response.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub lookup: Lookup,
    pub status: CacheStatus,
    /// How long clients may consider the value current.
    pub max_age: Duration,
}

impl Resolved {
    pub fn value(&self) -> &Value {
        self.lookup.value()
    }

    /// The value of the `Cache-Control` response header.
    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.max_age.as_secs())
    }
}

#[derive(Clone, Debug)]
pub struct CacheFirstRouter {
    orchestrator: CacheOrchestrator,
    compute: ComputeService,
    on_demand_ttl: Duration,
}

impl CacheFirstRouter {
    pub fn new(orchestrator: CacheOrchestrator, compute: ComputeService, on_demand_ttl: Duration) -> Self {
        Self {
            orchestrator,
            compute,
            on_demand_ttl,
        }
    }

    /// Answers a request for `operation` with the given query parameters from the cache.
    ///
    /// Errors are only returned if computing failed and there is nothing stale to fall back to.
    pub async fn resolve(&self, operation: &Operation, request: &Params) -> Result<Resolved, ComputeError> {
        let exact_key = CacheKey::new(&operation.name, request);

        let (lookup, status) = if let Some(lookup) = self.orchestrator.peek(&exact_key).await {
            (lookup, CacheStatus::Hit)
        } else if let Some(lookup) = self.peek_default(operation, request).await {
            (lookup, CacheStatus::DefaultHit)
        } else {
            let query = operation.query(request);
            let result = self
                .orchestrator
                .get_or_compute(&exact_key, self.on_demand_ttl, || self.compute.compute(&query))
                .await;
            let lookup = match result {
                Ok(lookup) => lookup,
                Err(err) => self.stale_default(operation, request).await.ok_or(err)?,
            };
            let status = match lookup.source {
                Source::Computed => CacheStatus::Miss,
                Source::Stale => CacheStatus::Stale,
                Source::Memory | Source::Durable => CacheStatus::Hit,
            };
            (lookup, status)
        };

        metric!(
            counter("router.requests") += 1,
            "operation" => &operation.name,
            "status" => status.as_str(),
        );
        tracing::debug!(key = %exact_key, status = status.as_str(), "Resolved request");

        let max_age = lookup.remaining_ttl(self.orchestrator.now());
        Ok(Resolved {
            lookup,
            status,
            max_age,
        })
    }

    async fn peek_default(&self, operation: &Operation, request: &Params) -> Option<Lookup> {
        if !operation.matches_defaults(request) {
            return None;
        }
        self.orchestrator.peek(&operation.default_key()).await
    }

    /// Falls back to an expired entry of the default parameterization.
    async fn stale_default(&self, operation: &Operation, request: &Params) -> Option<Lookup> {
        if !operation.matches_defaults(request) {
            return None;
        }
        let lookup = self.orchestrator.peek_stale(&operation.default_key()).await?;
        tracing::warn!(
            key = %lookup.entry.key,
            expiry = %lookup.entry.expiry,
            "Computation failed, serving stale default entry",
        );
        Some(lookup)
    }

    /// Computes the operation without consulting or updating the cache.
    pub async fn compute_fresh(&self, operation: &Operation, request: &Params) -> Result<Value, ComputeError> {
        metric!(counter("router.requests") += 1, "operation" => &operation.name, "status" => "fresh");
        self.compute.compute(&operation.query(request)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::caching::{DurableStore, ManualClock};
    use crate::retry::RetryPolicy;
    use crate::types::Query;
    use crate::upstream::{ComputeFuture, Upstream};

    /// Echoes the query, or fails while `failing` is set.
    #[derive(Debug, Default)]
    struct EchoUpstream {
        hits: AtomicUsize,
        failing: AtomicBool,
    }

    impl Upstream for EchoUpstream {
        fn compute(&self, query: &Query) -> ComputeFuture {
            let hit = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
            let failing = self.failing.load(Ordering::SeqCst);
            let params = query.params.clone();
            Box::pin(async move {
                if failing {
                    return Err(ComputeError::Upstream("503 Service Unavailable".into()));
                }
                Ok(json!({"params": params, "computation": hit}))
            })
        }
    }

    struct Setup {
        router: CacheFirstRouter,
        upstream: Arc<EchoUpstream>,
        clock: ManualClock,
        operation: Operation,
    }

    impl Setup {
        fn new() -> Self {
            let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
            let orchestrator =
                CacheOrchestrator::new(100, DurableStore::disabled(), Arc::new(clock.clone()));
            let upstream = Arc::new(EchoUpstream::default());
            let policy = RetryPolicy::new(Duration::from_secs(1), 1, Duration::ZERO);
            let compute = ComputeService::new(upstream.clone(), policy);
            let router = CacheFirstRouter::new(orchestrator, compute, Duration::from_secs(600));

            let operation = Operation {
                name: "ndvi".into(),
                route: None,
                params: params(&[("region", "delta"), ("year", "2023")]),
            };

            Self {
                router,
                upstream,
                clock,
                operation,
            }
        }

        fn hits(&self) -> usize {
            self.upstream.hits.load(Ordering::SeqCst)
        }

        /// Stores the default parameterization the way the scheduler does.
        async fn precompute(&self) {
            let query = self.operation.query(&Params::new());
            let compute = &self.router.compute;
            self.router
                .orchestrator
                .refresh(&self.operation.default_key(), Duration::from_secs(3600), || {
                    compute.compute(&query)
                })
                .await
                .unwrap();
        }
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_default_hit() {
        terracache_test::setup();
        let setup = Setup::new();
        setup.precompute().await;
        assert_eq!(setup.hits(), 1);

        let resolved = setup.router.resolve(&setup.operation, &Params::new()).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::DefaultHit);
        assert_eq!(resolved.cache_control(), "public, max-age=3600");

        let request = params(&[("year", "2023")]);
        let resolved = setup.router.resolve(&setup.operation, &request).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::DefaultHit);
        assert_eq!(resolved.value()["params"]["region"], "delta");

        assert_eq!(setup.hits(), 1);
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let setup = Setup::new();
        setup.precompute().await;

        let request = params(&[("year", "2020")]);
        let resolved = setup.router.resolve(&setup.operation, &request).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::Miss);
        assert_eq!(
            resolved.value()["params"],
            json!({"region": "delta", "year": "2020"})
        );
        assert_eq!(resolved.max_age, Duration::from_secs(600));

        setup.clock.advance(chrono::Duration::seconds(100));
        let resolved = setup.router.resolve(&setup.operation, &request).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::Hit);
        assert_eq!(resolved.cache_control(), "public, max-age=500");

        assert_eq!(setup.hits(), 2);
    }

    #[tokio::test]
    async fn test_unknown_params_are_passed_through() {
        let setup = Setup::new();

        let request = params(&[("cloud_cover", "20")]);
        let resolved = setup.router.resolve(&setup.operation, &request).await.unwrap();

        assert_eq!(resolved.status, CacheStatus::Miss);
        assert_eq!(resolved.value()["params"]["cloud_cover"], "20");
        assert_eq!(resolved.value()["params"]["year"], "2023");
    }

    #[tokio::test]
    async fn test_default_request_without_precompute() {
        let setup = Setup::new();

        let resolved = setup.router.resolve(&setup.operation, &Params::new()).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::Miss);

        let resolved = setup.router.resolve(&setup.operation, &Params::new()).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::Hit);
        assert_eq!(setup.hits(), 1);
    }

    #[tokio::test]
    async fn test_stale_fallback() {
        let setup = Setup::new();
        let request = params(&[("year", "2020")]);
        setup.router.resolve(&setup.operation, &request).await.unwrap();

        setup.clock.advance(chrono::Duration::seconds(601));
        setup.upstream.failing.store(true, Ordering::SeqCst);

        let resolved = setup.router.resolve(&setup.operation, &request).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::Stale);
        assert_eq!(resolved.cache_control(), "public, max-age=0");
        assert_eq!(resolved.value()["computation"], 1);
    }

    #[tokio::test]
    async fn test_stale_default_fallback() {
        let setup = Setup::new();
        setup.precompute().await;

        setup.clock.advance(chrono::Duration::seconds(3601));
        setup.upstream.failing.store(true, Ordering::SeqCst);

        let resolved = setup.router.resolve(&setup.operation, &Params::new()).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::Stale);
        assert_eq!(resolved.cache_control(), "public, max-age=0");
        assert_eq!(resolved.value()["computation"], 1);
        assert_eq!(resolved.lookup.entry.key, setup.operation.default_key());

        let request = params(&[("year", "2023")]);
        let resolved = setup.router.resolve(&setup.operation, &request).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::Stale);

        // other parameters never fall back to the default entry
        let request = params(&[("year", "2020")]);
        let err = setup.router.resolve(&setup.operation, &request).await.unwrap_err();
        assert_eq!(err.kind(), "upstream");
    }

    #[tokio::test]
    async fn test_errors_without_fallback() {
        let setup = Setup::new();
        setup.upstream.failing.store(true, Ordering::SeqCst);

        let err = setup
            .router
            .resolve(&setup.operation, &Params::new())
            .await
            .unwrap_err();
        assert_eq!(err, ComputeError::Upstream("503 Service Unavailable".into()));
    }

    #[tokio::test]
    async fn test_fresh_bypasses_cache() {
        let setup = Setup::new();
        setup.precompute().await;

        let value = setup
            .router
            .compute_fresh(&setup.operation, &Params::new())
            .await
            .unwrap();
        assert_eq!(value["computation"], 2);

        let value = setup
            .router
            .compute_fresh(&setup.operation, &Params::new())
            .await
            .unwrap();
        assert_eq!(value["computation"], 3);

        // the precomputed entry is still served
        let resolved = setup.router.resolve(&setup.operation, &Params::new()).await.unwrap();
        assert_eq!(resolved.status, CacheStatus::DefaultHit);
        assert_eq!(resolved.value()["computation"], 1);
    }
}
