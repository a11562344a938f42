//! Admission Middleware
//!
//! Charges every API request against the per-client bucket of its source IP
//! and then the global bucket. Denied requests get 429 with `Retry-After`;
//! admitted ones carry `x-ratelimit-remaining`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::context::AppContext;
use crate::error::ApiError;

/// Key used when no client address can be determined.
const UNKNOWN_CLIENT: &str = "unknown";

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Extract the client key from a request, considering proxy headers.
///
/// `X-Forwarded-For` (first hop), then `X-Real-IP`, then the socket peer.
pub fn client_key(request: &Request) -> String {
    if let Some(forwarded_for) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
    {
        // X-Forwarded-For can contain multiple IPs, take the first one
        if let Some(first) = forwarded_for.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Rate limiting middleware.
pub async fn rate_limit_middleware(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    if !ctx.admission.is_enabled() {
        return next.run(request).await;
    }

    let key = client_key(&request);
    match ctx.admission.check(&key) {
        Ok(decision) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(
                X_RATELIMIT_LIMIT.clone(),
                HeaderValue::from(ctx.admission.per_client().config().max_tokens),
            );
            headers.insert(
                X_RATELIMIT_REMAINING.clone(),
                HeaderValue::from(decision.remaining),
            );
            response
        }
        Err(err) => {
            tracing::debug!(client = %key, error = %err, "Request rate limited");
            ApiError::from(err).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/documents/orders/o-1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).expect("request")
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let request = request_with(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_key(&request), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_when_no_forwarded_for() {
        let request = request_with(&[("x-real-ip", " 198.51.100.2 ")]);
        assert_eq!(client_key(&request), "198.51.100.2");
    }

    #[test]
    fn test_connect_info_fallback() {
        let mut request = request_with(&[]);
        let addr: SocketAddr = "192.0.2.10:5555".parse().expect("addr");
        request.extensions_mut().insert(ConnectInfo(addr));
        assert_eq!(client_key(&request), "192.0.2.10");
    }

    #[test]
    fn test_unknown_client() {
        assert_eq!(client_key(&request_with(&[])), UNKNOWN_CLIENT);
    }
}
