//! Volume browsing session handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::models::OkResponse;
use tracing::debug;

use crate::errors::PanelError;
use crate::server::state::ServerState;
use crate::sessions::session_prefix;

/// `POST /api/volumes/{name}/browse`
pub async fn start_session_handler(
    State(state): State<Arc<ServerState>>,
    Path(volume): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    Ok(Json(state.sessions.start(&volume).await?))
}

/// `POST /api/volumes/browse/{sid}/heartbeat`
pub async fn heartbeat_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    state.sessions.heartbeat(&session_id)?;
    Ok(Json(OkResponse { ok: true }))
}

/// `POST /api/volumes/browse/{sid}/close`
pub async fn close_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    state.sessions.close(&session_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

/// `ANY /api/volumes/browse/{sid}/fb`
pub async fn proxy_root_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    request: Request,
) -> Result<Response, PanelError> {
    proxy(&state, &session_id, "/", request).await
}

/// `ANY /api/volumes/browse/{sid}/fb/{*path}`
pub async fn proxy_handler(
    State(state): State<Arc<ServerState>>,
    Path((session_id, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, PanelError> {
    proxy(&state, &session_id, &path, request).await
}

async fn proxy(
    state: &ServerState,
    session_id: &str,
    subpath: &str,
    request: Request,
) -> Result<Response, PanelError> {
    let session = state.sessions.touch(session_id)?;
    debug!("Proxying session {} to {}", session_id, session.address);
    state
        .proxy
        .forward(&session.address, &session_prefix(session_id), subpath, request)
        .await
}
