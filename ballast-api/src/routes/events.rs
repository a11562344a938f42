//! Analytics Event Intake
//!
//! `POST /events` queues the event and answers 202. A full queue answers
//! 503 with `QUEUE_FULL` so clients back off.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{ApiError, ApiResult};
use crate::events::AnalyticsEvent;

/// Longest accepted event name.
pub const MAX_EVENT_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Deserialize)]
pub struct TrackEventRequest {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEventResponse {
    pub id: Uuid,
    pub queue_depth: usize,
}

pub async fn track_event(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<TrackEventRequest>,
) -> ApiResult<(StatusCode, Json<TrackEventResponse>)> {
    let name = req.name.trim();
    if name.is_empty() || name.len() > MAX_EVENT_NAME_LEN {
        return Err(ApiError::invalid_input(format!(
            "event name must be 1 to {} characters",
            MAX_EVENT_NAME_LEN
        )));
    }

    let event = AnalyticsEvent::new(name, req.payload, ctx.clock.wall());
    let id = event.id;
    ctx.events.try_enqueue(event)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TrackEventResponse {
            id,
            queue_depth: ctx.events.depth(),
        }),
    ))
}

pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new().route("/", post(track_event)).with_state(ctx)
}
