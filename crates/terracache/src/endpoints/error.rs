use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};
use terracache_service::caching::ComputeError;

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    kind: &'static str,
    err: anyhow::Error,
}

impl ResponseError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthorized",
            err: anyhow::anyhow!("missing or invalid admin secret"),
        }
    }
}

impl From<ComputeError> for ResponseError {
    fn from(err: ComputeError) -> Self {
        let status = match err {
            ComputeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ComputeError::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ComputeError::Upstream(_) | ComputeError::Malformed(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            kind: err.kind(),
            err: anyhow::Error::new(err).context("failed to compute result"),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            err,
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::new(self.kind, self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    kind: String,
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    causes: Option<Vec<String>>,
}

impl ApiErrorResponse {
    fn new(kind: &str, err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse {
            kind: kind.to_owned(),
            detail,
            causes,
        }
    }
}
