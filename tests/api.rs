//! Control API driven through the axum router.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use control_plane::config::parse_config;
use control_plane::http::build_router;
use control_plane::ControlPlane;

mod common;

use common::ScriptedServices;

const SERVICES: &str = r#"
    [[services]]
    name = "db"
    kind = "database"

    [[services]]
    name = "api"
    kind = "gateway"
    dependencies = ["db"]
"#;

fn app(extra: &str) -> (Router, Arc<ControlPlane>) {
    let scripted = Arc::new(ScriptedServices::default());
    let config = parse_config(&format!("{SERVICES}\n{extra}")).unwrap();
    let plane = Arc::new(ControlPlane::with_probe(config, scripted.clone()).unwrap());
    for name in ["db", "api"] {
        plane.hooks.register(name, scripted.clone());
    }
    (build_router(plane.clone()), plane)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, json)
}

#[tokio::test]
async fn test_services_listing_and_request_id() {
    let (app, _) = app("");
    let (status, headers, body) = call(&app, Method::GET, "/services", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));
    let names: Vec<&str> = body.as_array().unwrap().iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["api", "db"]);
}

#[tokio::test]
async fn test_startup_then_status_reports_last_operation() {
    let (app, _) = app("");

    let (status, _, report) = call(&app, Method::POST, "/startup", Some(json!({"targets": ["api"]}))).await;
    assert_eq!(status, StatusCode::OK, "{report}");
    assert_eq!(report["success"], true);
    assert_eq!(report["levels"], json!([["db"], ["api"]]));

    let (_, _, status_body) = call(&app, Method::GET, "/status", None).await;
    assert_eq!(status_body["services"]["api"], "healthy");
    assert_eq!(status_body["last_operation"]["operation"], "startup");

    let (status, _, health) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_restart_with_down_dependency_is_conflict() {
    let (app, _) = app("");

    let (status, _, body) = call(&app, Method::POST, "/restart", Some(json!({"service": "api"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "dependency_unhealthy");
    assert_eq!(body["target"], "db");

    let (status, _, body) = call(&app, Method::POST, "/restart", Some(json!({"service": "nope"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["target"], "nope");
}

#[tokio::test]
async fn test_strategy_switch() {
    let (app, plane) = app("");

    let (status, _, body) = call(&app, Method::PUT, "/router/strategy", Some(json!({"strategy": "weighted_random"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previous"], "round_robin");
    assert_eq!(plane.router.pools().strategy().as_str(), "weighted_random");

    let (status, _, body) = call(&app, Method::PUT, "/router/strategy", Some(json!({"strategy": "random"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");

    let (_, _, metrics) = call(&app, Method::GET, "/router/metrics", None).await;
    assert_eq!(metrics["strategy"], "weighted_random");
}

#[tokio::test]
async fn test_bearer_token_required_when_configured() {
    let (app, _) = app("[api]\napi_key = \"s3cret\"");

    let (status, _, body) = call(&app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let request = Request::builder()
        .uri("/status")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_route_endpoint_sets_cache_headers() {
    let (backend, _) = common::start_counting_backend(200, r#"{"rows":[]}"#).await;
    let (app, _) = app(&format!(
        r#"
        [[router.backends]]
        id = "db-1"
        service = "db"
        address = "http://{backend}"
        monitor = "db"

        [[cache.policies]]
        pattern = "select*"
        ttl_secs = 30
        "#
    ));

    let (status, headers, body) = call(&app, Method::POST, "/route/db/select", Some(json!({"table": "t"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"rows": []}));
    assert_eq!(headers["x-cache"], "miss");
    assert_eq!(headers["x-backend"], "db-1");

    let (_, headers, _) = call(&app, Method::POST, "/route/db/select", Some(json!({"table": "t"}))).await;
    assert_eq!(headers["x-cache"], "hit");
    assert!(!headers.contains_key("x-backend"));

    let (status, _, body) = call(&app, Method::POST, "/cache/invalidate", Some(json!({"pattern": "db:*"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 1);

    let (status, _, body) = call(&app, Method::POST, "/route/nope/select", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "service_not_found");
}

#[tokio::test]
async fn test_cache_warm_uses_configured_samples() {
    let (backend, calls) = common::start_counting_backend(200, r#"{"ok":true}"#).await;
    let (app, plane) = app(&format!(
        r#"
        [[router.backends]]
        id = "db-1"
        service = "db"
        address = "http://{backend}"
        monitor = "db"

        [[cache.policies]]
        pattern = "get_*"
        ttl_secs = 60

        [[cache.samples.db]]
        operation = "get_user"
        params = {{ id = 1 }}

        [[cache.samples.db]]
        operation = "delete_user"
        params = {{ id = 1 }}
        "#
    ));

    let (status, _, report) = call(&app, Method::POST, "/cache/warm", Some(json!({"service": "db"}))).await;
    assert_eq!(status, StatusCode::OK, "{report}");
    assert_eq!(report["requested"], 2);
    assert_eq!(report["succeeded"], 1);
    assert_eq!(report["success_ratio"], 0.5);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let hit = plane.router.route("db", "get_user", json!({"id": 1}), None).await.unwrap();
    assert_eq!(hit.cache, control_plane::routing::CacheStatus::Hit);
}

#[tokio::test]
async fn test_slow_backend_gets_structured_gateway_timeout() {
    let backend = common::start_programmable_backend(|_| async {
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        (200, r#"{"late":true}"#.to_string())
    })
    .await;
    let (app, _) = app(&format!(
        r#"
        [api]
        request_timeout_secs = 1

        [router]
        request_timeout_secs = 10

        [[router.backends]]
        id = "db-1"
        service = "db"
        address = "http://{backend}"
        "#
    ));

    let started = std::time::Instant::now();
    let (status, _, body) = call(&app, Method::POST, "/route/db/select", Some(json!({"table": "t"}))).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"], "request_timeout");
    assert_eq!(body["target"], "db");
    assert!(body["message"].as_str().unwrap().contains("db"));
    assert!(started.elapsed() < std::time::Duration::from_secs(3));
}

#[tokio::test]
async fn test_cache_warm_without_samples_is_rejected() {
    let (app, _) = app(
        r#"
        [[router.backends]]
        id = "db-1"
        service = "db"
        address = "http://127.0.0.1:9"
        "#,
    );
    let (status, _, body) = call(&app, Method::POST, "/cache/warm", Some(json!({"service": "db"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "no_warm_queries");
    assert_eq!(body["target"], "db");
}
