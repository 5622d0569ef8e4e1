//! Timeout and retry handling for individual upstream calls.

use std::future::Future;
use std::time::Duration;

use humantime_serde::re::humantime::format_duration;

use crate::caching::ComputeError;
use crate::config::UpstreamConfig;

/// How a single upstream call is bounded and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The time a single attempt may take.
    pub timeout: Duration,
    /// The maximum number of attempts, at least one.
    pub max_attempts: usize,
    /// The fixed pause between two attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_attempts: usize, delay: Duration) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.timeout, config.max_attempts, config.retry_delay)
    }
}

/// Runs the future created by `call` until it succeeds, at most `policy.max_attempts` times.
///
/// Each attempt is bounded by `policy.timeout`. An attempt running into the timeout is dropped,
/// which cancels whatever it was doing, and counts as failed with [`ComputeError::Timeout`].
/// Failed attempts are followed by a fixed `policy.delay` before the next one. Once all attempts
/// are exhausted, the error of the last one is returned.
pub async fn execute<G, F, T>(task_name: &str, policy: &RetryPolicy, mut call: G) -> Result<T, ComputeError>
where
    G: FnMut() -> F,
    F: Future<Output = Result<T, ComputeError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        tracing::debug!(task_name, attempt, max_attempts, "Calling upstream");

        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ComputeError::Timeout(policy.timeout)),
        };

        let err = match result {
            Ok(value) => {
                metric!(counter("retry.attempts") += attempt as i64, "task_name" => task_name, "status" => "ok");
                return Ok(value);
            }
            Err(err) => err,
        };

        metric!(counter("retry.failures") += 1, "task_name" => task_name, "kind" => err.kind());

        if attempt >= max_attempts {
            metric!(counter("retry.attempts") += attempt as i64, "task_name" => task_name, "status" => "err");
            tracing::error!(
                error = &err as &dyn std::error::Error,
                task_name,
                attempt,
                "Upstream call failed, giving up",
            );
            return Err(err);
        }

        tracing::warn!(
            error = &err as &dyn std::error::Error,
            task_name,
            attempt,
            "Upstream call failed, retrying in {}",
            format_duration(policy.delay),
        );
        tokio::time::sleep(policy.delay).await;
    }
}
