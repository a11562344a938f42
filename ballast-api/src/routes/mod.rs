//! REST API Routes Module
//!
//! Includes:
//! - Supplier location updates and proximity queries
//! - Generic document reads and patches
//! - Payment confirmation (critical writes)
//! - Analytics event intake (queued writes)
//! - Health checks and Prometheus metrics, exempt from rate limiting

pub mod documents;
pub mod events;
pub mod health;
pub mod payments;
pub mod suppliers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, header::HeaderName, HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::context::AppContext;
use crate::middleware::rate_limit_middleware;
use crate::telemetry::{metrics_handler, observability_middleware};

pub use documents::create_router as documents_router;
pub use events::create_router as events_router;
pub use health::create_router as health_router;
pub use payments::create_router as payments_router;
pub use suppliers::create_router as suppliers_router;

/// How long browsers may cache a preflight response.
pub const CORS_MAX_AGE: Duration = Duration::from_secs(3600);

// ============================================================================
// ROUTER ASSEMBLY
// ============================================================================

/// Build the complete application router.
///
/// Rate limiting wraps the API routes only, so probes and scrapes keep
/// working while clients are being throttled. Observability, tracing and
/// CORS wrap everything.
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    let api = Router::new()
        .nest("/suppliers", suppliers::create_router(ctx.clone()))
        .nest("/documents", documents::create_router(ctx.clone()))
        .nest("/payments", payments::create_router(ctx.clone()))
        .nest("/events", events::create_router(ctx.clone()))
        .layer(from_fn_with_state(ctx.clone(), rate_limit_middleware));

    let scrape = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(ctx.clone());

    Router::new()
        .merge(api)
        .nest("/health", health::create_router(ctx.clone()))
        .merge(scrape)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors_layer(&ctx.config.server))
                .layer(from_fn_with_state(ctx.clone(), observability_middleware)),
        )
}

fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            header::RETRY_AFTER,
        ])
        .max_age(CORS_MAX_AGE);

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: no origins configured, allowing all origins");
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    tracing::info!(origins = ?config.cors_origins, "CORS: restricting origins");
    cors.allow_origin(origins)
}
