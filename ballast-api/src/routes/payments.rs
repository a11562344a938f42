//! Payment Confirmation Route
//!
//! Payment state is critical data: the confirmation is written directly to
//! the store through its breaker and the response is only sent once the
//! write has landed. An open store breaker surfaces as 503 so the client
//! retries instead of assuming success.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use ballast_core::{Consistency, DocumentKey, FieldPatch, Timestamp};
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::{ApiError, ApiResult};

pub const PAYMENTS_COLLECTION: &str = "payments";

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmPaymentRequest {
    /// Amount in minor units
    pub amount: i64,
    pub currency: String,
    /// Gateway reference for reconciliation
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmPaymentResponse {
    pub id: String,
    pub status: String,
    pub confirmed_at: Timestamp,
}

pub async fn confirm_payment(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmPaymentRequest>,
) -> ApiResult<Json<ConfirmPaymentResponse>> {
    if req.amount <= 0 {
        return Err(ApiError::invalid_input("amount must be positive"));
    }
    if req.currency.trim().is_empty() {
        return Err(ApiError::invalid_input("currency is required"));
    }

    let confirmed_at = ctx.clock.wall();
    let mut patch = FieldPatch::new()
        .with("status", "confirmed")
        .with("amount", req.amount)
        .with("currency", req.currency.trim().to_uppercase())
        .with("confirmed_at", confirmed_at.to_rfc3339());
    if let Some(reference) = req.gateway_reference {
        patch.insert("gateway_reference", reference);
    }

    let key = DocumentKey::new(PAYMENTS_COLLECTION, id.clone());
    ctx.writes
        .persist(key.clone(), patch, Consistency::Critical)
        .await?;
    ctx.documents.delete(&key);

    tracing::info!(payment_id = %id, amount = req.amount, "Payment confirmed");

    Ok(Json(ConfirmPaymentResponse {
        id,
        status: "confirmed".to_string(),
        confirmed_at,
    }))
}

pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/:id/confirm", post(confirm_payment))
        .with_state(ctx)
}
