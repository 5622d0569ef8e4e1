//! Types shared by the caching layer, the scheduler and the HTTP API.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Normalized request parameters, ordered by name.
pub type Params = BTreeMap<String, String>;

/// The identifier of one cacheable operation invocation.
///
/// A key is derived deterministically from an operation name plus its parameters: just the name
/// when there are no parameters, otherwise `"{name}?{params}"` where the parameters are
/// form-urlencoded in name order. Everything besides [`CacheKey::new`] treats the key as opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates the key for `operation` invoked with `params`.
    pub fn new(operation: &str, params: &Params) -> Self {
        if params.is_empty() {
            return Self::from_raw(operation);
        }

        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        Self::from_raw(format!("{operation}?{query}"))
    }

    /// Wraps an already built key.
    pub fn from_raw(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One operation offered by the remote computation service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Operation {
    /// The operation name sent to the upstream.
    pub name: String,

    /// The HTTP route under which the operation is exposed.
    ///
    /// Defaults to the operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    /// The default parameterization, which is precomputed by the scheduler.
    #[serde(default)]
    pub params: Params,
}

impl Operation {
    /// The route path segment of this operation, without leading or trailing slashes.
    pub fn route(&self) -> &str {
        self.route
            .as_deref()
            .unwrap_or(&self.name)
            .trim_matches('/')
    }

    /// The canonical key under which the default parameterization is cached.
    pub fn default_key(&self) -> CacheKey {
        CacheKey::new(&self.name, &self.params)
    }

    /// Whether every parameter in `request` equals the corresponding default.
    ///
    /// This is trivially the case for a request without parameters.
    pub fn matches_defaults(&self, request: &Params) -> bool {
        request
            .iter()
            .all(|(name, value)| self.params.get(name) == Some(value))
    }

    /// The default parameters overlaid with the parameters of `request`.
    pub fn merged_params(&self, request: &Params) -> Params {
        let mut params = self.params.clone();
        params.extend(request.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }

    /// Builds the upstream query for the given request parameters.
    pub fn query(&self, request: &Params) -> Query {
        Query {
            operation: self.name.clone(),
            params: self.merged_params(request),
        }
    }
}

/// A single invocation of the remote computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub operation: String,
    pub params: Params,
}
