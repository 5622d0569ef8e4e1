use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::types::Operation;

/// Routes which are taken by the service itself.
const RESERVED_ROUTES: &[&str] = &["admin", "healthcheck"];

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for terracache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    ///
    /// If this is set, the environment will be read from the `TERRACACHE_ENV` environment
    /// variable.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "terracache".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// How the remote computation service is reached.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// The endpoint computations are posted to.
    pub url: Option<Url>,

    /// A file containing the bearer token used to authenticate with the upstream.
    pub credentials_path: Option<PathBuf>,

    /// The time a single computation attempt may take.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The number of attempts per computation, at least one.
    pub max_attempts: usize,

    /// The pause between two attempts of the same computation.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// The timeout for establishing a connection to the upstream.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            credentials_path: None,
            timeout: Duration::from_secs(120),
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Fine-tuning of cache sizes and expiry.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The maximum number of entries kept in memory.
    pub in_memory_capacity: u64,

    /// How long results computed by the scheduler stay valid.
    ///
    /// This should exceed the scheduling interval, so that results never expire between two
    /// scheduled runs.
    #[serde(with = "humantime_serde")]
    pub scheduled_ttl: Duration,

    /// How long results computed on demand stay valid.
    #[serde(with = "humantime_serde")]
    pub on_demand_ttl: Duration,

    /// How long expired entries are kept on disk before `cleanup` removes them.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            in_memory_capacity: 10_000,
            scheduled_ttl: Duration::from_secs(25 * 3600),
            on_demand_ttl: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Controls the precompute scheduler.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether registered operations are precomputed at all.
    pub enabled: bool,

    /// The delay between startup and the first run.
    #[serde(with = "humantime_serde")]
    pub startup_delay: Duration,

    /// The pause between two operations within a run.
    #[serde(with = "humantime_serde")]
    pub pacing_delay: Duration,

    /// The time of day of the daily run, as `HH:MM` or `HH:MM:SS`.
    #[serde(deserialize_with = "deserialize_time_of_day")]
    pub daily_at: NaiveTime,

    /// The fixed UTC offset `daily_at` is given in, for example `+05:30`.
    #[serde(deserialize_with = "deserialize_utc_offset")]
    pub utc_offset: FixedOffset,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay: Duration::from_secs(10),
            pacing_delay: Duration::from_secs(5),
            daily_at: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default(),
            utc_offset: Utc.fix(),
        }
    }
}

/// The configuration of a terracache instance, usually read from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to persist results in. Default is to keep them in memory only.
    pub cache_dir: Option<PathBuf>,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// The shared secret expected in the `x-admin-secret` header of administrative requests.
    ///
    /// Defaults to the `TERRACACHE_ADMIN_SECRET` environment variable. Without a secret,
    /// administrative requests are always rejected.
    pub admin_secret: Option<String>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The remote computation service.
    pub upstream: UpstreamConfig,

    /// Fine-tune cache sizes and expiry.
    pub caches: CacheConfig,

    /// Fine-tune the precompute scheduler.
    pub scheduler: SchedulerConfig,

    /// The operations exposed via HTTP, in the order in which they are precomputed.
    pub operations: Vec<Operation>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            bind: "127.0.0.1:3040".to_owned(),
            admin_secret: env::var("TERRACACHE_ADMIN_SECRET")
                .ok()
                .filter(|secret| !secret.is_empty()),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            upstream: UpstreamConfig::default(),
            caches: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            operations: Vec::new(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every operation can be routed unambiguously.
    fn validate(&self) -> Result<()> {
        let mut routes = BTreeMap::new();
        let mut names = BTreeSet::new();
        for operation in &self.operations {
            if operation.name.is_empty() {
                anyhow::bail!("operations need a name");
            }
            if !names.insert(operation.name.as_str()) {
                anyhow::bail!("operation `{}` is defined twice", operation.name);
            }

            let route = operation.route();
            let first_segment = route.split('/').next().unwrap_or_default();
            if route.is_empty() || RESERVED_ROUTES.contains(&first_segment) {
                anyhow::bail!(
                    "operation `{}` uses the reserved route `/{route}`",
                    operation.name
                );
            }
            if route
                .split('/')
                .any(|segment| segment.is_empty() || segment.starts_with([':', '*']))
            {
                anyhow::bail!(
                    "operation `{}` uses the invalid route `/{route}`",
                    operation.name
                );
            }
            // every operation is also served uncached under `/fresh`
            for route in [route.to_owned(), format!("{route}/fresh")] {
                if let Some(other) = routes.insert(route.clone(), operation.name.as_str()) {
                    anyhow::bail!(
                        "operation `{}` uses route `/{route}`, which is already taken by `{other}`",
                        operation.name
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

fn deserialize_time_of_day<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<NaiveTime, D::Error> {
    let value = String::deserialize(deserializer)?;
    NaiveTime::parse_from_str(&value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&value, "%H:%M:%S"))
        .map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(&value), &"a time of day like `03:00`")
        })
}

fn deserialize_utc_offset<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<FixedOffset, D::Error> {
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(|_| {
        de::Error::invalid_value(de::Unexpected::Str(&value), &"a UTC offset like `+05:30`")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.on_demand_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.caches.scheduled_ttl, Duration::from_secs(25 * 3600));
        assert_eq!(cfg.upstream.max_attempts, 3);
        assert_eq!(cfg.scheduler.daily_at, NaiveTime::from_hms_opt(3, 0, 0).unwrap());
        assert_eq!(cfg.scheduler.utc_offset.local_minus_utc(), 0);
        assert!(cfg.operations.is_empty());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            cache_dir: /data
            bind: 0.0.0.0:8080
            admin_secret: hunter2
            upstream:
              url: https://compute.example.com/v1/run
              credentials_path: /secrets/token
              timeout: 90s
              max_attempts: 2
            caches:
              on_demand_ttl: 30m
            scheduler:
              pacing_delay: 3s
              daily_at: "04:30"
              utc_offset: "+05:30"
            operations:
              - name: ndvi
                route: vegetation/ndvi
                params:
                  region: delta
                  year: "2023"
              - name: lst
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.cache_dir.as_deref(), Some(Path::new("/data")));
        assert_eq!(cfg.admin_secret.as_deref(), Some("hunter2"));
        assert_eq!(
            cfg.upstream.url.as_ref().map(Url::as_str),
            Some("https://compute.example.com/v1/run")
        );
        assert_eq!(cfg.upstream.timeout, Duration::from_secs(90));
        assert_eq!(cfg.upstream.max_attempts, 2);
        // unset values keep their defaults
        assert_eq!(cfg.upstream.retry_delay, Duration::from_secs(5));
        assert_eq!(cfg.caches.on_demand_ttl, Duration::from_secs(30 * 60));
        assert_eq!(cfg.caches.in_memory_capacity, 10_000);
        assert_eq!(cfg.scheduler.pacing_delay, Duration::from_secs(3));
        assert_eq!(cfg.scheduler.daily_at, NaiveTime::from_hms_opt(4, 30, 0).unwrap());
        assert_eq!(cfg.scheduler.utc_offset.local_minus_utc(), 5 * 3600 + 30 * 60);

        assert_eq!(cfg.operations.len(), 2);
        assert_eq!(cfg.operations[0].route(), "vegetation/ndvi");
        assert_eq!(cfg.operations[0].params["year"], "2023");
        assert_eq!(cfg.operations[1].route(), "lst");
    }

    #[test]
    fn test_time_of_day_with_seconds() {
        let yaml = r#"
            scheduler:
              daily_at: "23:59:30"
              utc_offset: "-03:00"
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.scheduler.daily_at, NaiveTime::from_hms_opt(23, 59, 30).unwrap());
        assert_eq!(cfg.scheduler.utc_offset.local_minus_utc(), -3 * 3600);
    }

    #[test]
    fn test_invalid_values() {
        let yaml = r#"
            scheduler:
              daily_at: "25:00"
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());

        let yaml = r#"
            scheduler:
              utc_offset: "IST"
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_file() {
        let err = Config::from_reader("  \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }

    #[test]
    fn test_conflicting_routes() {
        let yaml = r#"
            operations:
              - name: a
                route: ndvi
              - name: b
                route: /ndvi/
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"operation `b` uses route `/ndvi`, which is already taken by `a`");

        let yaml = r#"
            operations:
              - name: admin
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"operation `admin` uses the reserved route `/admin`");

        let yaml = r#"
            operations:
              - name: a
                route: a//b
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());

        let yaml = r#"
            operations:
              - name: a
              - name: b
                route: a/fresh
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"operation `b` uses route `/a/fresh`, which is already taken by `a`");

        let yaml = r#"
            operations:
              - name: b
                route: a/fresh
              - name: a
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"operation `a` uses route `/a/fresh`, which is already taken by `b`");

        let yaml = r#"
            operations:
              - name: a
                route: a/*rest
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"operation `a` uses the invalid route `/a/*rest`");

        let yaml = r#"
            operations:
              - name: a
              - name: a
                route: other
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"operation `a` is defined twice");
    }
}
