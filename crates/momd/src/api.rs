//! HTTP API for daemon liveness and Prometheus metrics
//!
//! `/healthz` reports every daemon task with its lifecycle state, the tasks
//! found dead by the liveness check and, on the host, the readiness of each
//! monitored guest. `/readyz` turns unready once the daemon stops running or
//! any task died.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use mom_lib::{
    health::{DaemonStatus, HealthRegistry},
    observability::MomMetrics,
    terminable::Terminable,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: MomMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: MomMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

/// 200 while every task is alive, 503 once one died
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        DaemonStatus::Healthy => StatusCode::OK,
        DaemonStatus::Unhealthy => {
            warn!(dead = ?health.dead_components, "Health check found dead components");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };

    (status_code, Json(health))
}

/// 200 while the daemon runs with all tasks alive
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until terminated
pub async fn serve(port: u16, state: Arc<AppState>, terminable: Terminable) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { terminable.terminated().await })
        .await?;

    Ok(())
}
