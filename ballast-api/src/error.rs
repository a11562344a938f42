//! Error Types for the BALLAST HTTP surface
//!
//! - `ApiError` struct for structured error responses
//! - `ErrorCode` enum for categorizing errors
//! - `IntoResponse` implementation for Axum HTTP responses
//! - the mapping from layer errors (`BallastError`) to HTTP statuses
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ballast_core::{
    AdmissionError, BallastError, CapacityError, ConfigError, GeoError, RemoteError, StoreError,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    /// Coordinate, radius or geohash out of range
    InvalidCoordinate,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested entity does not exist
    EntityNotFound,

    // ========================================================================
    // Admission (429)
    // ========================================================================
    /// Request rate limit exceeded
    TooManyRequests,

    // ========================================================================
    // Remote and capacity errors (502, 503, 504)
    // ========================================================================
    /// A dependency answered with a failure
    DependencyFailed,

    /// Circuit breaker for a dependency is open
    CircuitOpen,

    /// A bounded queue refused the work
    QueueFull,

    /// Service is temporarily unavailable
    ServiceUnavailable,

    /// A dependency call exceeded its deadline
    Timeout,

    // ========================================================================
    // Server Errors (500)
    // ========================================================================
    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput | ErrorCode::InvalidCoordinate => StatusCode::BAD_REQUEST,
            ErrorCode::EntityNotFound => StatusCode::NOT_FOUND,
            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::DependencyFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::CircuitOpen | ErrorCode::QueueFull | ErrorCode::ServiceUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::InvalidCoordinate => "Invalid coordinate",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::TooManyRequests => "Rate limit exceeded",
            ErrorCode::DependencyFailed => "Upstream dependency failed",
            ErrorCode::CircuitOpen => "Dependency temporarily unavailable",
            ErrorCode::QueueFull => "Too much pending work, try again later",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Sent as `Retry-After` on 429 responses
    #[serde(skip)]
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after_ms: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn entity_not_found(entity_type: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} with id {} not found", entity_type, id),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    /// Create a TooManyRequests error carrying retry guidance.
    pub fn too_many_requests(retry_after_ms: u64) -> Self {
        let mut err = Self::new(
            ErrorCode::TooManyRequests,
            format!("Rate limit exceeded. Retry after {}ms", retry_after_ms),
        )
        .with_details(serde_json::json!({ "retry_after_ms": retry_after_ms }));
        err.retry_after_ms = Some(retry_after_ms);
        err
    }

    /// Whole seconds for the `Retry-After` header, never below one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_ms.map(|ms| ms.div_ceil(1000).max(1))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after_secs();
        let mut response = (status, Json(self)).into_response();

        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

// ============================================================================
// CONVERSIONS FROM LAYER ERRORS
// ============================================================================

impl From<BallastError> for ApiError {
    fn from(err: BallastError) -> Self {
        match err {
            BallastError::Admission(AdmissionError::RateLimited { retry_after_ms, .. }) => {
                ApiError::too_many_requests(retry_after_ms)
            }

            BallastError::Remote(RemoteError::CircuitOpen { dependency }) => ApiError::new(
                ErrorCode::CircuitOpen,
                format!("{} is temporarily unavailable", dependency),
            )
            .with_details(serde_json::json!({ "dependency": dependency })),
            BallastError::Remote(RemoteError::Timeout {
                dependency,
                timeout_ms,
            }) => ApiError::new(
                ErrorCode::Timeout,
                format!("{} did not answer within {}ms", dependency, timeout_ms),
            ),
            BallastError::Remote(RemoteError::CallFailed { dependency, reason }) => {
                tracing::warn!(dependency = %dependency, reason = %reason, "Dependency call failed");
                ApiError::new(
                    ErrorCode::DependencyFailed,
                    format!("{} call failed", dependency),
                )
            }

            BallastError::Capacity(CapacityError::QueueFull { queue, max_size }) => ApiError::new(
                ErrorCode::QueueFull,
                format!("Queue {} is full", queue),
            )
            .with_details(serde_json::json!({ "queue": queue, "max_size": max_size })),

            BallastError::Store(StoreError::NotFound { collection, doc_id }) => {
                ApiError::entity_not_found(&collection, doc_id)
            }
            BallastError::Store(StoreError::Unavailable { reason }) => {
                tracing::warn!(reason = %reason, "Store unavailable");
                ApiError::service_unavailable("Document store unavailable")
            }
            BallastError::Store(err @ StoreError::WriteRejected { .. })
            | BallastError::Store(err @ StoreError::BatchTooLarge { .. }) => {
                tracing::error!(error = %err, "Store rejected write");
                ApiError::internal_error("Write rejected by the document store")
            }

            BallastError::Geo(err) => {
                let message = err.to_string();
                let code = match err {
                    GeoError::InvalidCoordinate { .. }
                    | GeoError::InvalidRadius { .. }
                    | GeoError::InvalidGeohash { .. } => ErrorCode::InvalidCoordinate,
                    GeoError::InvalidPrecision { .. } => ErrorCode::InternalError,
                };
                ApiError::new(code, message)
            }

            BallastError::Config(ConfigError::InvalidValue { field, .. }) => {
                tracing::error!(field = %field, "Configuration error surfaced at request time");
                ApiError::internal_error("Server misconfigured")
            }
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        BallastError::from(err).into()
    }
}

impl From<GeoError> for ApiError {
    fn from(err: GeoError) -> Self {
        BallastError::from(err).into()
    }
}

impl From<CapacityError> for ApiError {
    fn from(err: CapacityError) -> Self {
        BallastError::from(err).into()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;
