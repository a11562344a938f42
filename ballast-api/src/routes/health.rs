//! Health Check Routes
//!
//! - `GET /health/ping`: plain "pong", no state touched
//! - `GET /health/live`: process is up
//! - `GET /health/ready`: folded component health, 503 when unhealthy
//! - `GET /health/metrics`: every component's stats as JSON

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use ballast_core::HealthStatus;
use serde::Serialize;

use crate::context::AppContext;

#[derive(Debug, Serialize)]
struct LivenessResponse {
    status: HealthStatus,
    version: &'static str,
    uptime_secs: u64,
}

pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

pub async fn liveness(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(LivenessResponse {
        status: HealthStatus::Healthy,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: ctx.uptime().as_secs(),
    })
}

/// Degraded still answers 200: the layer serves traffic with fallbacks.
pub async fn readiness(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let report = ctx.health();
    let status = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

pub async fn layer_metrics(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(ctx.snapshot())
}

pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
        .route("/metrics", get(layer_metrics))
        .with_state(ctx)
}
