use std::net::SocketAddr;

use anyhow::{Context, Result};
use terracache_service::config::Config;
use terracache_service::metric;
use terracache_service::services::SharedServices;

use crate::endpoints;

/// Starts the precompute scheduler and the HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("terracache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    runtime.block_on(async {
        let services = SharedServices::create(&config)
            .await
            .context("failed to create service state")?;
        let _scheduler = services.scheduler.spawn();

        let socket = config
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address `{}`", config.bind))?;
        tracing::info!(
            operations = services.operations.len(),
            "Starting HTTP server on {}",
            socket
        );

        axum_server::bind(socket)
            .serve(endpoints::create_app(services).into_make_service())
            .await
            .context("HTTP server failed")
    })?;

    tracing::info!("System shutdown complete");
    Ok(())
}
