//! Port query, notes and allocation handlers

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use openapi_server::models::{AllocateRequest, OkResponse, PortNoteRequest, PortRange};

use crate::errors::PanelError;
use crate::ports::query::PortQueryParams;
use crate::server::state::ServerState;

/// `GET /api/ports`
pub async fn query_ports_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<PortQueryParams>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.ports.query(params).await?))
}

/// `GET /api/ports/range`
pub async fn get_range_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.ports.range()?))
}

/// `POST /api/ports/range`
pub async fn set_range_handler(
    State(state): State<Arc<ServerState>>,
    Json(range): Json<PortRange>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.ports.set_range(range)?))
}

/// `POST /api/ports/note`
pub async fn set_note_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<PortNoteRequest>,
) -> Result<impl IntoResponse, PanelError> {
    state.ports.set_note(
        request.port,
        &request.port_type,
        &request.protocol,
        &request.note,
    )?;
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /api/ports/allocate`
pub async fn allocate_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<AllocateRequest>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.ports.allocate(request).await?))
}
