//! End-to-end tests for the BALLAST HTTP surface.

mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, Method, StatusCode};
use ballast_api::LayerConfig;
use ballast_core::{Dependency, DocumentKey};
use ballast_resilience::{CircuitBreakerConfig, RateLimiterConfig};
use ballast_test_utils::FlakyStore;
use ballast_writes::InMemoryStore;
use serde_json::json;

use support::{assert_status, body_json, body_text, request, TestApp};

fn in_memory_app(config: LayerConfig) -> (TestApp, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    (TestApp::new(config, store.clone()), store)
}

// ============================================================================
// HEALTH AND METRICS
// ============================================================================

#[tokio::test]
async fn test_ping_returns_pong() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let response = app.get("/health/ping").await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(body_text(response).await, "pong");
}

#[tokio::test]
async fn test_readiness_reports_healthy_layer() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let response = app.get("/health/ready").await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_readiness_fails_while_store_breaker_is_open() {
    let mut config = LayerConfig::default();
    config.breakers.insert(
        Dependency::BackingStore,
        CircuitBreakerConfig::default().with_failure_threshold(1),
    );
    let store = Arc::new(FlakyStore::new());
    store.set_down(true);
    let app = TestApp::new(config, store);

    let confirm = app
        .json(
            Method::POST,
            "/payments/p-1/confirm",
            json!({"amount": 1200, "currency": "usd"}),
        )
        .await;
    assert_status(&confirm, StatusCode::SERVICE_UNAVAILABLE);

    let response = app.get("/health/ready").await;
    assert_status(&response, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_cors_preflight_is_answered() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let preflight = axum::http::Request::builder()
        .method(Method::OPTIONS)
        .uri("/documents/orders/o-1")
        .header(header::ORIGIN, "https://app.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PATCH")
        .body(axum::body::Body::empty())
        .expect("request");

    let response = app.send(preflight).await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_prometheus_text() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let _ = app.get("/health/ping").await;

    let response = app.get("/metrics").await;
    assert_status(&response, StatusCode::OK);
    let text = body_text(response).await;
    assert!(text.contains("http_requests_total"));
    assert!(text.contains("breaker_state"));
}

#[tokio::test]
async fn test_layer_metrics_snapshot_is_json() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let response = app.get("/health/metrics").await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["breakers"].is_array());
    assert!(body["caches"].is_array());
}

// ============================================================================
// ADMISSION
// ============================================================================

#[tokio::test]
async fn test_rate_limit_returns_429_with_retry_after() {
    let mut config = LayerConfig::default();
    config.admission.per_client = RateLimiterConfig {
        max_tokens: 2,
        refill_per_sec: 1.0,
        max_clients: 100,
    };
    let (app, _) = in_memory_app(config);

    for _ in 0..2 {
        let response = app.get("/suppliers/nearby?lat=1.0&lng=1.0&radius_km=1").await;
        assert_status(&response, StatusCode::OK);
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    let response = app.get("/suppliers/nearby?lat=1.0&lng=1.0&radius_km=1").await;
    assert_status(&response, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("retry-after header");
    assert!(retry_after >= 1);
    let body = body_json(response).await;
    assert_eq!(body["code"], "TOO_MANY_REQUESTS");
}

#[tokio::test]
async fn test_rate_limit_does_not_cover_health_routes() {
    let mut config = LayerConfig::default();
    config.admission.per_client.max_tokens = 1;
    let (app, _) = in_memory_app(config);

    for _ in 0..5 {
        assert_status(&app.get("/health/ping").await, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_rate_limit_is_per_client() {
    let mut config = LayerConfig::default();
    config.admission.per_client.max_tokens = 1;
    let (app, _) = in_memory_app(config);

    let uri = "/suppliers/nearby?lat=1.0&lng=1.0&radius_km=1";
    assert_status(&app.get(uri).await, StatusCode::OK);
    assert_status(&app.get(uri).await, StatusCode::TOO_MANY_REQUESTS);

    let other = axum::http::Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.20")
        .body(axum::body::Body::empty())
        .expect("request");
    assert_status(&app.send(other).await, StatusCode::OK);
}

// ============================================================================
// SUPPLIERS
// ============================================================================

#[tokio::test]
async fn test_location_update_is_visible_to_nearby_queries() {
    let (app, _) = in_memory_app(LayerConfig::default());

    let response = app
        .json(
            Method::PUT,
            "/suppliers/s-1/location",
            json!({"lat": 12.9716, "lng": 77.5946, "metadata": {"status": "available"}}),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "s-1");
    assert!(!body["cell"].as_str().unwrap_or_default().is_empty());

    let uri = "/suppliers/nearby?lat=12.972&lng=77.595&radius_km=2";
    let first = body_json(app.get(uri).await).await;
    assert_eq!(first["cached"], false);
    assert_eq!(first["suppliers"][0]["id"], "s-1");

    let second = body_json(app.get(uri).await).await;
    assert_eq!(second["cached"], true);
}

#[tokio::test]
async fn test_location_updates_coalesce_into_one_store_write() {
    let (app, store) = in_memory_app(LayerConfig::default());

    for lat in [12.970, 12.971, 12.972, 12.973, 12.974] {
        let response = app
            .json(Method::PUT, "/suppliers/s-9/location", json!({"lat": lat, "lng": 77.59}))
            .await;
        assert_status(&response, StatusCode::OK);
    }
    assert_eq!(store.physical_writes(), 0);

    let report = app.ctx.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.coalesced_writes, 1);
    assert_eq!(store.physical_writes(), 1);
    let doc = store
        .document(&DocumentKey::new("suppliers", "s-9"))
        .expect("supplier persisted");
    assert_eq!(doc.get("lat"), Some(&json!(12.974)));
}

#[tokio::test]
async fn test_invalid_coordinate_is_rejected() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let response = app
        .json(Method::PUT, "/suppliers/s-1/location", json!({"lat": 95.0, "lng": 0.0}))
        .await;
    assert_status(&response, StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_COORDINATE");
}

#[tokio::test]
async fn test_unknown_supplier_is_not_found() {
    let (app, _) = in_memory_app(LayerConfig::default());
    assert_status(&app.get("/suppliers/ghost").await, StatusCode::NOT_FOUND);

    let delete = app.send(request(Method::DELETE, "/suppliers/ghost", None)).await;
    assert_status(&delete, StatusCode::NOT_FOUND);
}

// ============================================================================
// DOCUMENTS
// ============================================================================

#[tokio::test]
async fn test_best_effort_patch_is_visible_after_shutdown_drain() {
    let (app, _) = in_memory_app(LayerConfig::default());

    let response = app
        .json(Method::PATCH, "/documents/orders/o-1", json!({"status": "packed"}))
        .await;
    assert_status(&response, StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["outcome"], "buffered");

    let before = app.get("/documents/orders/o-1?consistency=critical").await;
    assert_status(&before, StatusCode::NOT_FOUND);

    let report = app.ctx.shutdown(Duration::from_secs(5)).await;
    assert!(!report.timed_out);

    let after = app.get("/documents/orders/o-1?consistency=critical").await;
    assert_status(&after, StatusCode::OK);
    assert_eq!(body_json(after).await["data"]["status"], "packed");
}

#[tokio::test]
async fn test_best_effort_read_does_not_pin_pre_write_document() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let uri = "/documents/orders/o-3";

    let seeded = app
        .json(
            Method::PATCH,
            "/documents/orders/o-3?consistency=critical",
            json!({"status": "placed"}),
        )
        .await;
    assert_status(&seeded, StatusCode::OK);
    assert_eq!(body_json(app.get(uri).await).await["data"]["status"], "placed");

    let patched = app
        .json(Method::PATCH, uri, json!({"status": "packed"}))
        .await;
    assert_status(&patched, StatusCode::ACCEPTED);

    // Still the store copy while the write is coalescing, and not cached
    assert_eq!(body_json(app.get(uri).await).await["data"]["status"], "placed");
    let key = DocumentKey::new("orders", "o-3");
    assert!(!app.ctx.documents.has(&key));

    app.ctx.coalescer.flush_all().await.expect("coalescer flush");
    assert_eq!(body_json(app.get(uri).await).await["data"]["status"], "placed");

    let summary = app.ctx.batch_writer.flush().await;
    assert_eq!(summary.committed, 1);
    assert!(!app.ctx.documents.has(&key));
    assert_eq!(body_json(app.get(uri).await).await["data"]["status"], "packed");
}

#[tokio::test]
async fn test_critical_patch_commits_before_responding() {
    let (app, store) = in_memory_app(LayerConfig::default());

    let response = app
        .json(
            Method::PATCH,
            "/documents/orders/o-2?consistency=critical",
            json!({"status": "shipped"}),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(body_json(response).await["outcome"], "committed");

    let doc = store
        .document(&DocumentKey::new("orders", "o-2"))
        .expect("committed");
    assert_eq!(doc.get("status"), Some(&json!("shipped")));
}

#[tokio::test]
async fn test_empty_patch_is_rejected() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let response = app
        .json(Method::PATCH, "/documents/orders/o-3", json!({}))
        .await;
    assert_status(&response, StatusCode::BAD_REQUEST);
}

// ============================================================================
// PAYMENTS
// ============================================================================

#[tokio::test]
async fn test_payment_confirmation_is_committed() {
    let (app, store) = in_memory_app(LayerConfig::default());

    let response = app
        .json(
            Method::POST,
            "/payments/p-7/confirm",
            json!({"amount": 4999, "currency": "eur", "gateway_reference": "ch_123"}),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "confirmed");

    let doc = store
        .document(&DocumentKey::new("payments", "p-7"))
        .expect("payment persisted");
    assert_eq!(doc.get("status"), Some(&json!("confirmed")));
    assert_eq!(doc.get("currency"), Some(&json!("EUR")));
}

#[tokio::test]
async fn test_payment_confirmation_fails_fast_once_breaker_opens() {
    let mut config = LayerConfig::default();
    config.breakers.insert(
        Dependency::BackingStore,
        CircuitBreakerConfig::default().with_failure_threshold(2),
    );
    let store = Arc::new(FlakyStore::new());
    store.set_down(true);
    let app = TestApp::new(config, store.clone());
    let body = json!({"amount": 100, "currency": "usd"});

    for _ in 0..2 {
        let response = app.json(Method::POST, "/payments/p-1/confirm", body.clone()).await;
        assert_status(&response, StatusCode::SERVICE_UNAVAILABLE);
    }
    let calls_before = store.calls();

    let response = app.json(Method::POST, "/payments/p-1/confirm", body).await;
    assert_status(&response, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "CIRCUIT_OPEN");
    assert_eq!(store.calls(), calls_before);
}

#[tokio::test]
async fn test_payment_with_non_positive_amount_is_rejected() {
    let (app, store) = in_memory_app(LayerConfig::default());
    let response = app
        .json(Method::POST, "/payments/p-2/confirm", json!({"amount": 0, "currency": "usd"}))
        .await;
    assert_status(&response, StatusCode::BAD_REQUEST);
    assert!(store.is_empty());
}

// ============================================================================
// EVENTS
// ============================================================================

#[tokio::test]
async fn test_event_is_accepted_and_persisted_on_drain() {
    let (app, store) = in_memory_app(LayerConfig::default());

    let response = app
        .json(Method::POST, "/events", json!({"name": "app_opened", "payload": {"v": 3}}))
        .await;
    assert_status(&response, StatusCode::ACCEPTED);
    let body = body_json(response).await;
    let id = body["id"].as_str().expect("event id").to_string();

    let report = app.ctx.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.events_processed, 1);
    assert!(store
        .document(&DocumentKey::new("analytics_events", id))
        .is_some());
}

#[tokio::test]
async fn test_full_event_queue_returns_503() {
    let mut config = LayerConfig::default();
    config.events_queue.max_size = 1;
    let (app, _) = in_memory_app(config);
    let event = json!({"name": "tap"});

    let first = app.json(Method::POST, "/events", event.clone()).await;
    assert_status(&first, StatusCode::ACCEPTED);

    let second = app.json(Method::POST, "/events", event).await;
    assert_status(&second, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(second).await["code"], "QUEUE_FULL");
}

#[tokio::test]
async fn test_blank_event_name_is_rejected() {
    let (app, _) = in_memory_app(LayerConfig::default());
    let response = app.json(Method::POST, "/events", json!({"name": "  "})).await;
    assert_status(&response, StatusCode::BAD_REQUEST);
}
