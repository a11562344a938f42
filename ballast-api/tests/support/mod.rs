//! Shared helpers for driving the router in-process.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use ballast_api::{create_router, AppContext, LayerConfig};
use ballast_core::ManualClock;
use ballast_writes::DocumentStore;
use serde_json::Value;
use tower::ServiceExt;

/// Upper bound on response bodies read by tests.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct TestApp {
    pub ctx: Arc<AppContext>,
    pub clock: Arc<ManualClock>,
    router: Router,
}

impl TestApp {
    /// Router over `store` with timers left stopped, so buffered writes
    /// only move when a test flushes or shuts down.
    pub fn new(config: LayerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let clock = ManualClock::shared();
        let ctx = AppContext::with_clock(config, store, clock.clone()).expect("context");
        let router = create_router(ctx.clone());
        Self { ctx, clock, router }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.send(request(Method::GET, uri, None)).await
    }

    pub async fn json(&self, method: Method, uri: &str, body: Value) -> Response {
        self.send(request(method, uri, Some(body))).await
    }
}

pub fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.7");
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

pub fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(
        response.status(),
        expected,
        "unexpected status for response with headers {:?}",
        response.headers()
    );
}
