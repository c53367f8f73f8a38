//! HTTP endpoints: liveness, readiness and the Prometheus scrape.
//!
//! - `GET /health`: always 200 while the process is serving
//! - `GET /health/ready`: 200 when the database answers and the consumer has
//!   not given up, 503 otherwise
//! - `GET /metrics`: Prometheus text format, 404 when metrics are disabled

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use deliverygo_core::event_store::DeliveryEventStore;
use deliverygo_runtime::HealthState;
use deliverygo_runtime::health::{HealthCheck, HealthReport};
use deliverygo_runtime::metrics::MetricsServer;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const DATABASE_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Consumer state written by the supervisor
    pub health: HealthState,
    /// Event store, pinged for readiness
    pub events: Arc<dyn DeliveryEventStore>,
    /// Prometheus renderer
    pub metrics: Arc<MetricsServer>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Liveness response.
#[derive(Serialize)]
pub struct LivenessResponse {
    /// Always `ok`
    pub status: &'static str,
    /// Service version
    pub version: &'static str,
}

async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let database = match tokio::time::timeout(DATABASE_PING_TIMEOUT, state.events.ping()).await {
        Ok(Ok(())) => HealthCheck::healthy("database"),
        Ok(Err(e)) => HealthCheck::unhealthy("database", e.to_string()),
        Err(_) => HealthCheck::unhealthy("database", "ping timed out"),
    };

    let report = HealthReport::new(vec![database, HealthCheck::consumer(state.health.consumer())]);
    let code = if report.is_ready() {
        StatusCode::OK
    } else {
        tracing::warn!(status = %report.status, "Readiness check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
