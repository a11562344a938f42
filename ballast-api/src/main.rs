//! BALLAST API Server Entry Point
//!
//! Bootstraps configuration, builds the application context, and serves the
//! Axum router until SIGINT or SIGTERM. Buffered writes are drained before
//! the process exits.

use std::net::SocketAddr;
use std::sync::Arc;

use ballast_api::telemetry::{init_tracer, TelemetryConfig};
use ballast_api::{create_router, ApiError, ApiResult, AppContext, LayerConfig};
use ballast_writes::InMemoryStore;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracer(&telemetry_config)?;

    let config = LayerConfig::from_env();
    let addr = config
        .server
        .socket_addr()
        .map_err(|e| ApiError::invalid_input(e.to_string()))?;
    let shutdown_timeout = config.shutdown_timeout;

    // The standalone binary runs over the in-memory store
    let store = Arc::new(InMemoryStore::new());
    let ctx = AppContext::new(config, store)?;
    ctx.start();

    let app = create_router(ctx.clone());

    tracing::info!(
        %addr,
        service = %telemetry_config.service_name,
        version = %telemetry_config.service_version,
        "Starting BALLAST API server"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;

    let report = ctx.shutdown(shutdown_timeout).await;
    if report.timed_out {
        tracing::warn!(
            aborted_tasks = report.aborted_tasks,
            "Exited before buffered writes were fully drained"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
