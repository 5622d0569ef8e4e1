use std::sync::Arc;

use axum::extract::{Extension, Query, State};
use axum::http::HeaderName;
use axum::http::header::CACHE_CONTROL;
use axum::response::{IntoResponse, Response};
use axum::Json;
use terracache_service::services::SharedServices;
use terracache_service::types::{Operation, Params};

use super::ResponseError;

/// Reports how a response was served.
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

pub async fn get_cached(
    State(services): State<SharedServices>,
    Extension(operation): Extension<Arc<Operation>>,
    Query(params): Query<Params>,
) -> Result<Response, ResponseError> {
    let resolved = services.router.resolve(&operation, &params).await?;

    let headers = [
        (CACHE_CONTROL, resolved.cache_control()),
        (X_CACHE, resolved.status.as_str().to_owned()),
    ];
    Ok((headers, Json(resolved.value())).into_response())
}

pub async fn get_fresh(
    State(services): State<SharedServices>,
    Extension(operation): Extension<Arc<Operation>>,
    Query(params): Query<Params>,
) -> Result<Response, ResponseError> {
    let value = services.router.compute_fresh(&operation, &params).await?;
    Ok(([(CACHE_CONTROL, "no-store")], Json(value)).into_response())
}
