//! BALLAST API - HTTP Surface and Application Lifecycle
//!
//! This crate wires the BALLAST components into one application context and
//! exposes them over a REST API (Axum). Every request passes admission
//! control; reads go through the hot caches; writes are routed by
//! consistency class through the coalescer, the batch writer or the write
//! queue, each guarded by a per-dependency circuit breaker.
//!
//! The context owns every background task and drains buffered writes on
//! shutdown within a bounded deadline.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod jobs;
pub mod middleware;
pub mod routes;
pub mod telemetry;

// Re-export commonly used types
pub use config::{LayerConfig, ServerConfig};
pub use context::{AppContext, HealthReport, LayerSnapshot, NearbyCache, ShutdownReport};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use events::{AnalyticsEvent, StoreEventSink};
pub use middleware::{client_key, rate_limit_middleware};
pub use routes::create_router;
