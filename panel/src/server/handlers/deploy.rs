//! Deployment and project handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use openapi_server::models::{DeployRequest, JobSubmitted};

use crate::errors::PanelError;
use crate::jobs::Job;
use crate::server::state::ServerState;

fn submitted(job: Arc<Job>) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(JobSubmitted {
            task_id: job.id().to_string(),
        }),
    )
}

/// `POST /api/templates/{id}/deploy`
pub async fn deploy_template_handler(
    State(state): State<Arc<ServerState>>,
    Path(template): Path<String>,
    Json(request): Json<DeployRequest>,
) -> Result<impl IntoResponse, PanelError> {
    let job = state.deployer.deploy_template(&template, request).await?;
    Ok(submitted(job))
}

/// `POST /api/projects/{name}/redeploy`
pub async fn redeploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(project): Path<String>,
    Json(request): Json<DeployRequest>,
) -> Result<impl IntoResponse, PanelError> {
    let job = state.deployer.redeploy(&project, request).await?;
    Ok(submitted(job))
}

/// `DELETE /api/projects/{name}`
pub async fn remove_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, PanelError> {
    let job = state.deployer.remove_project(&project).await?;
    Ok(submitted(job))
}
