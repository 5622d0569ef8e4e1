//! Exposes the command line application.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use terracache_service::caching;
use terracache_service::config::Config;
use terracache_service::metrics;

use crate::healthcheck;
use crate::logging;
use crate::server;

/// Terracache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the web server and the precompute scheduler.
    Run,

    /// Remove expired entries from the cache directory.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Check whether a running instance is healthy.
    Healthcheck {
        /// The address of the instance, defaults to the configured `bind` address.
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been started at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        if let Some(tag) = config.metrics.environment_tag.clone() {
            if let Ok(environment) = std::env::var("TERRACACHE_ENV") {
                tags.insert(tag, environment);
            }
        }
        configure_metrics(&config.metrics.prefix, statsd, tags)?;
    }

    match cli.command {
        Command::Run => server::run(config).context("failed to start the server")?,
        Command::Cleanup { dry_run } => {
            let stats = caching::cleanup(&config, dry_run).context("failed to clean up caches")?;
            tracing::info!(
                dry_run,
                removed_files = stats.removed_files,
                removed_bytes = stats.removed_bytes,
                retained_files = stats.retained_files,
                retained_bytes = stats.retained_bytes,
                "Cleaned up cache directory",
            );
        }
        Command::Healthcheck { addr, timeout } => healthcheck::healthcheck(&config, addr, timeout)?,
    }

    Ok(())
}

fn configure_metrics(prefix: &str, statsd: &str, tags: BTreeMap<String, String>) -> Result<()> {
    metrics::configure_statsd(prefix, statsd, tags)
        .with_context(|| format!("failed to configure statsd at {statsd}"))
}
