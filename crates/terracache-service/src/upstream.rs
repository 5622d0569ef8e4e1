//! Access to the remote computation service.
//!
//! The [`Upstream`] trait abstracts a single remote call, [`HttpUpstream`] implements it over
//! HTTP. The [`ComputeService`] wraps an upstream into the [`retry`](crate::retry) executor and
//! hands out the [`ComputeFn`]s the caching layer works with.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use reqwest::Url;
use serde_json::Value;

use crate::caching::ComputeError;
use crate::config::UpstreamConfig;
use crate::retry::{self, RetryPolicy};
use crate::types::Query;
use crate::utils::futures::{m, measure};

/// The maximum number of characters of an error response included in errors.
const MAX_ERROR_BODY: usize = 256;

/// A future resolving to the result of one computation.
pub type ComputeFuture = BoxFuture<'static, Result<Value, ComputeError>>;

/// A zero-argument callable performing one particular computation, including retries.
pub type ComputeFn = Arc<dyn Fn() -> ComputeFuture + Send + Sync>;

/// The remote computation service.
pub trait Upstream: fmt::Debug + Send + Sync + 'static {
    /// Performs a single attempt of the computation described by `query`.
    fn compute(&self, query: &Query) -> ComputeFuture;
}

/// An [`Upstream`] reached by posting `{"operation": ..., "params": {...}}` to a URL.
///
/// The response body is the computed document.
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: Url,
    token: Option<Arc<str>>,
}

impl fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("url", &self.url.as_str())
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl HttpUpstream {
    pub fn new(url: Url, token: Option<String>, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            url,
            token: token.map(Arc::from),
        })
    }

    /// Creates the upstream from configuration, reading the credentials file if configured.
    pub fn from_config(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .clone()
            .context("no upstream url configured")?;

        let token = match &config.credentials_path {
            Some(path) => {
                let token = std::fs::read_to_string(path).with_context(|| {
                    format!("failed to read upstream credentials from {}", path.display())
                })?;
                let token = token.trim();
                if token.is_empty() {
                    anyhow::bail!("upstream credentials file {} is empty", path.display());
                }
                Some(token.to_owned())
            }
            None => None,
        };

        Self::new(url, token, config.connect_timeout)
    }
}

impl Upstream for HttpUpstream {
    fn compute(&self, query: &Query) -> ComputeFuture {
        let mut request = self.client.post(self.url.clone()).json(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|e| ComputeError::Upstream(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let body: String = body.chars().take(MAX_ERROR_BODY).collect();
                return Err(ComputeError::Upstream(format!("{status}: {}", body.trim())));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| ComputeError::Upstream(e.to_string()))?;
            serde_json::from_slice(&body).map_err(|e| ComputeError::Malformed(e.to_string()))
        })
    }
}

/// Runs computations on an [`Upstream`], bounded by a [`RetryPolicy`].
#[derive(Clone, Debug)]
pub struct ComputeService {
    upstream: Arc<dyn Upstream>,
    policy: RetryPolicy,
}

impl ComputeService {
    pub fn new(upstream: Arc<dyn Upstream>, policy: RetryPolicy) -> Self {
        Self { upstream, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs the computation described by `query`, retrying failed attempts.
    pub async fn compute(&self, query: &Query) -> Result<Value, ComputeError> {
        metric!(counter("upstream.compute") += 1, "operation" => &query.operation);
        let future = retry::execute(&query.operation, &self.policy, || {
            self.upstream.compute(query)
        });
        let result = measure("upstream.compute", m::result, future).await;

        if let Err(err) = &result {
            metric!(
                counter("upstream.compute.failed") += 1,
                "operation" => &query.operation,
                "kind" => err.kind(),
            );
        }
        result
    }

    /// Returns a callable running the computation described by `query`.
    pub fn compute_fn(&self, query: Query) -> ComputeFn {
        let service = self.clone();
        let query = Arc::new(query);
        Arc::new(move || -> ComputeFuture {
            let service = service.clone();
            let query = Arc::clone(&query);
            Box::pin(async move { service.compute(&query).await })
        })
    }
}
