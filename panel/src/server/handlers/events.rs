//! Runtime event log handler

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::errors::PanelError;
use crate::server::state::ServerState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct EventListParams {
    pub limit: Option<usize>,
}

/// `GET /api/events`
pub async fn list_events_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<EventListParams>,
) -> Result<impl IntoResponse, PanelError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.events.recent(limit).await?))
}
