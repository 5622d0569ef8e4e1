//! Wiring of the process-wide services.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{CacheOrchestrator, DurableStore, SharedClock, SystemClock};
use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::router::CacheFirstRouter;
use crate::scheduler::{Registry, Scheduler};
use crate::types::Operation;
use crate::upstream::{ComputeService, HttpUpstream, Upstream};

/// All services shared between the request handlers and the background tasks.
#[derive(Clone, Debug)]
pub struct SharedServices {
    pub orchestrator: CacheOrchestrator,
    pub scheduler: Scheduler,
    pub router: CacheFirstRouter,
    pub operations: Arc<[Operation]>,
    pub admin_secret: Option<Arc<str>>,
}

impl SharedServices {
    /// Creates the services talking to the configured HTTP upstream.
    pub async fn create(config: &Config) -> Result<Self> {
        let upstream = HttpUpstream::from_config(&config.upstream)
            .context("failed to create upstream client")?;
        Self::with_upstream(config, Arc::new(upstream), Arc::new(SystemClock)).await
    }

    /// Creates the services around the given upstream and clock.
    ///
    /// Entries persisted by a previous process are loaded into memory, including expired ones,
    /// which serve as a fallback while the upstream is unavailable.
    pub async fn with_upstream(
        config: &Config,
        upstream: Arc<dyn Upstream>,
        clock: SharedClock,
    ) -> Result<Self> {
        let durable = DurableStore::new(config.cache_dir.as_deref());
        durable
            .clear_tmp()
            .context("failed to clear temporary cache files")?;

        let orchestrator = CacheOrchestrator::new(config.caches.in_memory_capacity, durable, clock);
        let restored = orchestrator
            .populate(orchestrator.durable().load_all().await)
            .await;
        if orchestrator.durable().is_enabled() {
            tracing::info!(restored, "Restored persisted cache entries");
        }

        let compute = ComputeService::new(upstream, RetryPolicy::from_config(&config.upstream));
        let registry = Registry::from_operations(&config.operations, &compute);
        let scheduler = Scheduler::new(
            registry,
            orchestrator.clone(),
            config.scheduler,
            config.caches.scheduled_ttl,
        );
        let router = CacheFirstRouter::new(orchestrator.clone(), compute, config.caches.on_demand_ttl);

        Ok(Self {
            orchestrator,
            scheduler,
            router,
            operations: config.operations.clone().into(),
            admin_secret: config.admin_secret.as_deref().map(Arc::from),
        })
    }
}
