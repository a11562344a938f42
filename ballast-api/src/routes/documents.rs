//! Generic Document Routes
//!
//! Reads go through the document cache and fall back to the store through
//! its breaker. `?consistency=critical` skips the cache. Patches are
//! coalesced and acknowledged with 202 before they reach the store.
//!
//! A key with a coalesced write still pending is read from the store but not
//! cached, since the store copy is about to change. Committed batches drop
//! their keys from the cache.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use ballast_cache::cache_aside;
use ballast_core::{Consistency, DocumentKey, FieldPatch};
use ballast_writes::PersistOutcome;
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsistencyQuery {
    #[serde(default)]
    pub consistency: Consistency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub collection: String,
    pub id: String,
    pub data: FieldPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteAccepted {
    pub collection: String,
    pub id: String,
    pub outcome: String,
}

fn outcome_name(outcome: PersistOutcome) -> &'static str {
    match outcome {
        PersistOutcome::Committed => "committed",
        PersistOutcome::Buffered => "buffered",
    }
}

pub async fn get_document(
    State(ctx): State<Arc<AppContext>>,
    Path((collection, id)): Path<(String, String)>,
    Query(query): Query<ConsistencyQuery>,
) -> ApiResult<Json<DocumentResponse>> {
    let key = DocumentKey::new(collection.clone(), id.clone());

    let found = match query.consistency {
        Consistency::Critical => ctx.writes.read_direct(&key).await?,
        Consistency::BestEffort if ctx.writes.coalescer().pending(&key).is_some() => {
            ctx.writes.read_direct(&key).await?
        }
        Consistency::BestEffort => {
            let ttl = ctx.documents.default_ttl();
            cache_aside(&ctx.documents, key.clone(), ttl, || async {
                ctx.writes.read_direct(&key).await
            })
            .await?
        }
    };

    let Some(data) = found else {
        return Err(ApiError::entity_not_found("Document", &key));
    };

    Ok(Json(DocumentResponse {
        collection,
        id,
        data,
    }))
}

pub async fn patch_document(
    State(ctx): State<Arc<AppContext>>,
    Path((collection, id)): Path<(String, String)>,
    Query(query): Query<ConsistencyQuery>,
    Json(patch): Json<FieldPatch>,
) -> ApiResult<(StatusCode, Json<WriteAccepted>)> {
    if patch.is_empty() {
        return Err(ApiError::invalid_input("patch must contain at least one field"));
    }

    let key = DocumentKey::new(collection.clone(), id.clone());
    let outcome = ctx
        .writes
        .persist(key.clone(), patch, query.consistency)
        .await?;

    // The cached copy no longer matches what the store will hold
    ctx.documents.delete(&key);

    let status = match outcome {
        PersistOutcome::Committed => StatusCode::OK,
        PersistOutcome::Buffered => StatusCode::ACCEPTED,
    };
    Ok((
        status,
        Json(WriteAccepted {
            collection,
            id,
            outcome: outcome_name(outcome).to_string(),
        }),
    ))
}

pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/:collection/:id", get(get_document).patch(patch_document))
        .with_state(ctx)
}
