use std::time::Duration;

use humantime_serde::re::humantime::format_duration;
use thiserror::Error;

/// An error that happens when computing a result on the upstream.
///
/// Only successful computations are ever cached, errors are reported to the caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    /// The upstream did not respond within the allotted window.
    #[error("computation timed out after {}", format_duration(*.0))]
    Timeout(Duration),
    /// The upstream could not be reached or responded with an error.
    ///
    /// The attached string contains the upstream's response.
    #[error("upstream error: {0}")]
    Upstream(String),
    /// The upstream responded successfully, but with a body that could not be understood.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in terracache itself.
    #[error("internal error")]
    InternalError,
}

impl ComputeError {
    /// A stable tag for this kind of error, used in metrics and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internal",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<std::io::Error> for ComputeError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<tokio::task::JoinError> for ComputeError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::from_std_error(err)
    }
}
