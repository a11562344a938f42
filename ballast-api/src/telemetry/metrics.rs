//! Prometheus Metrics Definitions
//!
//! Every metric lives in a registry owned by [`LayerMetrics`], which the
//! application context owns. Component gauges are refreshed from a
//! [`LayerSnapshot`] right before each scrape, so the hot paths never touch
//! Prometheus types.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use prometheus::{
    core::Collector, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use crate::context::{AppContext, LayerSnapshot};
use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Container for all BALLAST metrics.
#[derive(Clone)]
pub struct LayerMetrics {
    registry: Registry,

    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// 0 closed, 1 half-open, 2 open - labels: dependency
    pub breaker_state: GaugeVec,

    /// Breaker call counts - labels: dependency, outcome
    pub breaker_calls: GaugeVec,

    /// Live entries - labels: cache
    pub cache_entries: GaugeVec,

    /// Lifetime hit rate - labels: cache
    pub cache_hit_rate: GaugeVec,

    /// Items waiting - labels: queue
    pub queue_depth: GaugeVec,

    /// Items that exhausted their retries - labels: queue
    pub queue_failed: GaugeVec,

    /// Share of writes merged away - labels: coalescer
    pub coalescing_ratio: GaugeVec,

    /// Distinct documents awaiting flush - labels: coalescer
    pub coalescer_pending: GaugeVec,

    /// Operations buffered in the batch writer
    pub batch_writer_buffered: Gauge,

    /// Keys tracked per limiter - labels: limiter
    pub limiter_tracked_clients: GaugeVec,

    /// Entities tracked by the spatial index
    pub spatial_entities: Gauge,
}

fn register<C>(registry: &Registry, collector: C, name: &str) -> ApiResult<C>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| ApiError::internal_error(format!("Failed to register {}: {}", name, e)))?;
    Ok(collector)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> ApiResult<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)
        .map_err(|e| ApiError::internal_error(format!("Failed to create {}: {}", name, e)))?;
    register(registry, gauge, name)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> ApiResult<Gauge> {
    let gauge = Gauge::new(name, help)
        .map_err(|e| ApiError::internal_error(format!("Failed to create {}: {}", name, e)))?;
    register(registry, gauge, name)
}

impl LayerMetrics {
    /// Create a fresh registry and register all metrics in it.
    pub fn new() -> ApiResult<Self> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("ballast_http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )
        .map_err(|e| ApiError::internal_error(format!("Failed to create http_requests_total: {}", e)))?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ballast_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(HTTP_LATENCY_BUCKETS.to_vec()),
            &["method", "path"],
        )
        .map_err(|e| {
            ApiError::internal_error(format!("Failed to create http_request_duration_seconds: {}", e))
        })?;

        Ok(Self {
            http_requests_total: register(
                &registry,
                http_requests_total,
                "ballast_http_requests_total",
            )?,
            http_request_duration_seconds: register(
                &registry,
                http_request_duration_seconds,
                "ballast_http_request_duration_seconds",
            )?,
            breaker_state: gauge_vec(
                &registry,
                "ballast_breaker_state",
                "Circuit state per dependency (0 closed, 1 half-open, 2 open)",
                &["dependency"],
            )?,
            breaker_calls: gauge_vec(
                &registry,
                "ballast_breaker_calls",
                "Calls seen by each breaker by outcome",
                &["dependency", "outcome"],
            )?,
            cache_entries: gauge_vec(
                &registry,
                "ballast_cache_entries",
                "Entries held per cache",
                &["cache"],
            )?,
            cache_hit_rate: gauge_vec(
                &registry,
                "ballast_cache_hit_rate",
                "Hit rate per cache",
                &["cache"],
            )?,
            queue_depth: gauge_vec(
                &registry,
                "ballast_queue_depth",
                "Items waiting per write queue",
                &["queue"],
            )?,
            queue_failed: gauge_vec(
                &registry,
                "ballast_queue_failed",
                "Items that exhausted their retries per write queue",
                &["queue"],
            )?,
            coalescing_ratio: gauge_vec(
                &registry,
                "ballast_coalescing_ratio",
                "Share of received writes merged into an earlier pending write",
                &["coalescer"],
            )?,
            coalescer_pending: gauge_vec(
                &registry,
                "ballast_coalescer_pending",
                "Documents awaiting flush per coalescer",
                &["coalescer"],
            )?,
            batch_writer_buffered: gauge(
                &registry,
                "ballast_batch_writer_buffered",
                "Operations buffered in the batch writer",
            )?,
            limiter_tracked_clients: gauge_vec(
                &registry,
                "ballast_rate_limiter_tracked_clients",
                "Keys tracked per rate limiter",
                &["limiter"],
            )?,
            spatial_entities: gauge(
                &registry,
                "ballast_spatial_entities",
                "Entities tracked by the spatial index",
            )?,
            registry,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, status_str.as_str()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Copy component stats into the gauges.
    pub fn refresh(&self, snapshot: &LayerSnapshot) {
        for breaker in &snapshot.breakers {
            let dep = breaker.name.as_str();
            self.breaker_state
                .with_label_values(&[dep])
                .set(breaker.state.as_gauge());
            for (outcome, value) in [
                ("total", breaker.total_calls),
                ("rejected", breaker.rejected_calls),
                ("success", breaker.success_calls),
                ("failure", breaker.failure_calls),
            ] {
                self.breaker_calls
                    .with_label_values(&[dep, outcome])
                    .set(value as f64);
            }
        }

        for cache in &snapshot.caches {
            self.cache_entries
                .with_label_values(&[cache.name.as_str()])
                .set(cache.size as f64);
            self.cache_hit_rate
                .with_label_values(&[cache.name.as_str()])
                .set(cache.hit_rate);
        }

        for queue in &snapshot.queues {
            self.queue_depth
                .with_label_values(&[queue.name.as_str()])
                .set(queue.depth as f64);
            self.queue_failed
                .with_label_values(&[queue.name.as_str()])
                .set(queue.failed as f64);
        }

        let coalescer = &snapshot.coalescer;
        self.coalescing_ratio
            .with_label_values(&[coalescer.name.as_str()])
            .set(coalescer.coalescing_ratio);
        self.coalescer_pending
            .with_label_values(&[coalescer.name.as_str()])
            .set(coalescer.pending as f64);

        self.batch_writer_buffered
            .set(snapshot.batch_writer.buffered as f64);

        for limiter in [&snapshot.admission.per_client, &snapshot.admission.global] {
            self.limiter_tracked_clients
                .with_label_values(&[limiter.name.as_str()])
                .set(limiter.tracked_clients as f64);
        }

        self.spatial_entities.set(snapshot.spatial.entities as f64);
    }

    /// Encode the registry in the Prometheus text format.
    pub fn encode(&self) -> ApiResult<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| ApiError::internal_error(format!("Failed to encode metrics: {}", e)))?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for LayerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerMetrics").finish_non_exhaustive()
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    ctx.metrics.refresh(&ctx.snapshot());

    match ctx.metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.message.into_bytes(),
            )
        }
    }
}
