//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while
//!    terracache still writes into it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let _cache_dir = test::tempdir()`).
//!
//!  - When using [`MockUpstream`], make sure that it is held until all requests to it have been
//!    made. If the server is dropped, all connections to it will fail.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the terracache crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("terracache=trace,terracache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Creates a new test server from the given `axum` router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct UpstreamState {
    hits: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Mutex<Duration>,
    token: Mutex<Option<String>>,
    requests: Mutex<Vec<Value>>,
}

/// A stand-in for the remote computation service.
///
/// It accepts computation requests via `POST /compute` and answers with a document echoing the
/// requested operation and parameters, along with the number of the computation:
///
/// ```json
/// {"operation": "ndvi", "params": {"year": "2023"}, "computation": 1}
/// ```
///
/// The operations `malformed` and `broken` respond with an invalid body and a server error
/// respectively. Every request counts as a hit, whether it succeeds or not.
#[derive(Debug)]
pub struct MockUpstream {
    server: Server,
    state: Arc<UpstreamState>,
}

impl MockUpstream {
    pub fn new() -> Self {
        let state = Arc::new(UpstreamState::default());
        let router = Router::new()
            .route("/compute", post(compute))
            .with_state(Arc::clone(&state));

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// The URL computations are posted to.
    pub fn url(&self) -> Url {
        self.server.url("compute")
    }

    /// Responds to the next `count` requests with `503 Service Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.state.failures_left.store(count, Ordering::SeqCst);
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// Rejects requests without the given bearer token.
    pub fn require_token(&self, token: &str) {
        *self.state.token.lock().unwrap() = Some(token.to_owned());
    }

    /// The number of requests received so far.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// The bodies of all requests received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

async fn compute(
    State(state): State<Arc<UpstreamState>>,
    headers: HeaderMap,
    Json(query): Json<Value>,
) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    state.requests.lock().unwrap().push(query.clone());

    let token = state.token.lock().unwrap().clone();
    if let Some(token) = token {
        let expected = format!("Bearer {token}");
        let actual = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if actual != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
        }
    }

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let failed = state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failed {
        return (StatusCode::SERVICE_UNAVAILABLE, "quota exceeded").into_response();
    }

    match query["operation"].as_str() {
        Some("malformed") => (StatusCode::OK, "<html>oops</html>").into_response(),
        Some("broken") => (StatusCode::INTERNAL_SERVER_ERROR, "computation failed").into_response(),
        _ => Json(json!({
            "operation": query["operation"],
            "params": query["params"],
            "computation": hit,
        }))
        .into_response(),
    }
}
