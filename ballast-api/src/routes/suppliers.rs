//! Supplier Location Routes
//!
//! Suppliers report their position often. Each report updates the spatial
//! index synchronously and is mirrored to the store through the coalescer,
//! so a burst of reports from one supplier costs one store write.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use ballast_core::{Consistency, DocumentKey, FieldPatch};
use ballast_geo::{NearbyEntity, SpatialEntry};
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::{ApiError, ApiResult};

/// Collection supplier documents live in.
pub const SUPPLIERS_COLLECTION: &str = "suppliers";

/// Result cap when the caller does not pass `limit`.
pub const DEFAULT_NEARBY_LIMIT: usize = 20;

/// Hard cap on `limit`.
pub const MAX_NEARBY_LIMIT: usize = 200;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLocationRequest {
    pub lat: f64,
    pub lng: f64,
    /// Free-form fields stored with the position (status, vehicle, ...)
    #[serde(default)]
    pub metadata: FieldPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLocationResponse {
    pub id: String,
    pub cell: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearbyResponse {
    pub suppliers: Vec<NearbyEntity>,
    pub cached: bool,
}

/// Cache key for a nearby query. Coordinates are rounded to 4 decimals
/// (about 11m) so clients polling from the same spot share an entry.
pub fn nearby_cache_key(query: &NearbyQuery, limit: usize) -> String {
    format!(
        "{:.4}:{:.4}:{:.3}:{}",
        query.lat, query.lng, query.radius_km, limit
    )
}

// ============================================================================
// HANDLERS
// ============================================================================

pub async fn update_location(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateLocationRequest>,
) -> ApiResult<Json<UpdateLocationResponse>> {
    let cell = ctx
        .suppliers
        .upsert(id.clone(), req.lat, req.lng, req.metadata.clone())?;

    let mut patch = req.metadata;
    patch.insert("lat", req.lat);
    patch.insert("lng", req.lng);
    patch.insert("geohash", cell.clone());
    patch.insert("location_updated_at", ctx.clock.wall().to_rfc3339());

    ctx.writes
        .persist(
            DocumentKey::new(SUPPLIERS_COLLECTION, id.clone()),
            patch,
            Consistency::BestEffort,
        )
        .await?;

    Ok(Json(UpdateLocationResponse { id, cell }))
}

pub async fn nearby(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<NearbyQuery>,
) -> ApiResult<Json<NearbyResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_NEARBY_LIMIT);
    if limit == 0 || limit > MAX_NEARBY_LIMIT {
        return Err(ApiError::invalid_input(format!(
            "limit must be between 1 and {}",
            MAX_NEARBY_LIMIT
        )));
    }

    let key = nearby_cache_key(&query, limit);
    if let Some(suppliers) = ctx.nearby.get(&key) {
        return Ok(Json(NearbyResponse {
            suppliers,
            cached: true,
        }));
    }

    let suppliers = ctx
        .suppliers
        .nearest(query.lat, query.lng, query.radius_km, limit)?;
    ctx.nearby.insert(key, suppliers.clone());

    Ok(Json(NearbyResponse {
        suppliers,
        cached: false,
    }))
}

pub async fn get_supplier(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SpatialEntry>> {
    ctx.suppliers
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::entity_not_found("Supplier", &id))
}

pub async fn remove_supplier(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    ctx.suppliers
        .remove(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| ApiError::entity_not_found("Supplier", &id))
}

pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/nearby", get(nearby))
        .route("/:id", get(get_supplier).delete(remove_supplier))
        .route("/:id/location", put(update_location))
        .with_state(ctx)
}
