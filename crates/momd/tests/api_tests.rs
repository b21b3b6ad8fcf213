//! Integration tests for the daemon API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use mom_lib::{
    health::{components, HealthRegistry},
    observability::MomMetrics,
};
use momd::api::{create_router, AppState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::HOST_MONITOR).await;
    health_registry.register(components::HOST_POLICY).await;

    let metrics = MomMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["host_monitor"].is_object());
    assert!(health["components"]["host_policy"].is_object());
}

#[tokio::test]
async fn test_healthz_reports_task_states_and_guests() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_running(components::HOST_POLICY)
        .await;
    state
        .health_registry
        .set_guests(BTreeMap::from([
            ("vm-1".to_string(), true),
            ("vm-2".to_string(), false),
        ]))
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["components"]["host_monitor"]["status"], "starting");
    assert_eq!(health["components"]["host_policy"]["status"], "running");
    assert_eq!(health["dead_components"], serde_json::json!([]));
    assert_eq!(health["guests"]["vm-1"], true);
    assert_eq!(health["guests"]["vm-2"], false);
}

#[tokio::test]
async fn test_healthz_returns_503_when_component_died() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_dead(components::HOST_POLICY, "Task ended unexpectedly")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["components"]["host_policy"]["status"], "dead");
    assert_eq!(
        health["components"]["host_policy"]["message"],
        "Task ended unexpectedly"
    );
    assert_eq!(health["dead_components"], serde_json::json!(["host_policy"]));
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_component_died() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_dead(components::HOST_MONITOR, "Task ended unexpectedly")
        .await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["reason"], "Components died: host_monitor");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_cycle_latency(0.5);
    state.metrics.observe_collection_latency(0.001);
    state.metrics.set_guests_monitored(2);
    state.metrics.inc_cycles("completed");
    state.metrics.inc_balloon_operations();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("mom_cycle_latency_seconds_bucket"));
    assert!(metrics_text.contains("mom_collection_latency_seconds_count"));
    assert!(metrics_text.contains("mom_guests_monitored"));
    assert!(metrics_text.contains("mom_policy_cycles_total{outcome=\"completed\"}"));
    assert!(metrics_text.contains("mom_balloon_operations_total"));
}
