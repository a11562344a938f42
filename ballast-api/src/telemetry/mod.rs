//! BALLAST Telemetry - Observability Infrastructure
//!
//! Structured logging through `tracing` and a Prometheus registry owned by
//! the application context.

pub mod metrics;
pub mod middleware;
pub mod tracer;

pub use metrics::{metrics_handler, LayerMetrics};
pub use middleware::observability_middleware;
pub use tracer::{init_tracer, LogFormat, TelemetryConfig};
