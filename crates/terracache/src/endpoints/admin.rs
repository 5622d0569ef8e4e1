use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::Json;
use serde_json::{Value, json};
use terracache_service::services::SharedServices;

use super::ResponseError;

/// The header carrying the shared admin secret.
pub const X_ADMIN_SECRET: HeaderName = HeaderName::from_static("x-admin-secret");

/// Starts a precompute run in the background.
///
/// Requests are rejected unless they carry the configured admin secret. Without a configured
/// secret, every request is rejected.
pub async fn refresh(
    State(services): State<SharedServices>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), ResponseError> {
    let provided = headers.get(&X_ADMIN_SECRET).map(|value| value.as_bytes());
    let authorized = match (&services.admin_secret, provided) {
        (Some(expected), Some(provided)) => secrets_match(expected.as_bytes(), provided),
        _ => false,
    };
    if !authorized {
        tracing::warn!("Rejected unauthorized refresh request");
        return Err(ResponseError::unauthorized());
    }

    let running = services.scheduler.running();
    tracing::info!(running, "Precompute run triggered via admin endpoint");
    services.scheduler.trigger();

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "operations": services.operations.len()})),
    ))
}

/// Compares two secrets in time independent of where they differ.
///
/// Only the length of `expected` can be inferred from the timing.
fn secrets_match(expected: &[u8], provided: &[u8]) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    let diff = expected
        .iter()
        .zip(provided)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b));
    std::hint::black_box(diff) == 0
}
