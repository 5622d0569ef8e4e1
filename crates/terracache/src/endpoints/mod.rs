use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use terracache_service::metric;
use terracache_service::services::SharedServices;
use tower::ServiceBuilder;

mod admin;
mod error;
mod metrics;
mod operations;

pub use error::ResponseError;
use metrics::MetricsLayer;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

/// Builds the HTTP app, with a cached and a fresh route for every configured operation.
pub fn create_app(services: SharedServices) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);

    let mut router = Router::new().route("/admin/refresh", post(admin::refresh));
    for operation in services.operations.iter() {
        let route = format!("/{}", operation.route());
        let operation = Extension(Arc::new(operation.clone()));
        router = router
            .route(&route, get(operations::get_cached).layer(operation.clone()))
            .route(&format!("{route}/fresh"), get(operations::get_fresh).layer(operation));
    }

    router
        .with_state(services)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use reqwest::{Client, StatusCode};
    use serde_json::{Value, json};
    use terracache_service::caching::{ComputeError, SystemClock};
    use terracache_service::config::{Config, UpstreamConfig};
    use terracache_service::types::{Operation, Params, Query};
    use terracache_service::upstream::{ComputeFuture, Upstream};
    use terracache_test::Server;

    use super::*;

    /// Echoes queries, failing for the `broken` operation.
    #[derive(Debug, Default)]
    struct EchoUpstream {
        hits: AtomicUsize,
    }

    impl Upstream for EchoUpstream {
        fn compute(&self, query: &Query) -> ComputeFuture {
            let hit = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
            let query = query.clone();
            Box::pin(async move {
                match query.operation.as_str() {
                    "broken" => Err(ComputeError::Upstream("500 Internal Server Error".into())),
                    "slow" => Err(ComputeError::Timeout(Duration::from_secs(120))),
                    _ => Ok(json!({"params": query.params, "computation": hit})),
                }
            })
        }
    }

    fn operation(name: &str, route: Option<&str>, params: &[(&str, &str)]) -> Operation {
        Operation {
            name: name.into(),
            route: route.map(Into::into),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Params>(),
        }
    }

    async fn server(admin_secret: Option<&str>) -> (Server, Arc<EchoUpstream>) {
        terracache_test::setup();
        let config = Config {
            admin_secret: admin_secret.map(Into::into),
            upstream: UpstreamConfig {
                max_attempts: 1,
                ..Default::default()
            },
            operations: vec![
                operation("ndvi", Some("vegetation/ndvi"), &[("year", "2023")]),
                operation("broken", None, &[]),
                operation("slow", None, &[]),
            ],
            ..Default::default()
        };
        let upstream = Arc::new(EchoUpstream::default());
        let services = SharedServices::with_upstream(&config, upstream.clone(), Arc::new(SystemClock))
            .await
            .unwrap();
        (Server::with_router(create_app(services)), upstream)
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let (server, _) = server(None).await;

        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_cached_responses() {
        let (server, upstream) = server(None).await;
        let url = server.url("/vegetation/ndvi?year=2020");

        let response = reqwest::get(url.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "miss");
        let cache_control = response.headers()["cache-control"].to_str().unwrap().to_owned();
        assert!(cache_control.starts_with("public, max-age="), "{cache_control}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({"params": {"year": "2020"}, "computation": 1}));

        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.headers()["x-cache"], "hit");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["computation"], 1);

        assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_responses() {
        let (server, upstream) = server(None).await;

        for expected in 1..=2 {
            let response = reqwest::get(server.url("/vegetation/ndvi/fresh")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["cache-control"], "no-store");
            assert!(response.headers().get("x-cache").is_none());
            let body: Value = response.json().await.unwrap();
            assert_eq!(body["computation"], expected);
        }

        assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_responses() {
        let (server, _) = server(None).await;

        let response = reqwest::get(server.url("/broken")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value = response.json().await.unwrap();
        insta::assert_json_snapshot!(body, @r#"
        {
          "causes": [
            "upstream error: 500 Internal Server Error"
          ],
          "detail": "failed to compute result",
          "kind": "upstream"
        }
        "#);

        let response = reqwest::get(server.url("/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (server, _) = server(None).await;

        let response = reqwest::get(server.url("/ndvi")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_refresh() {
        let (server, upstream) = server(Some("hunter2")).await;
        let client = Client::new();

        let response = client.post(server.url("/admin/refresh")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = client
            .post(server.url("/admin/refresh"))
            .header("x-admin-secret", "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);

        let response = client
            .post(server.url("/admin/refresh"))
            .header("x-admin-secret", "hunter2")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_admin_refresh_without_secret() {
        let (server, _) = server(None).await;

        let response = Client::new()
            .post(server.url("/admin/refresh"))
            .header("x-admin-secret", "")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "unauthorized");
    }
}
