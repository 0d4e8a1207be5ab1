//! HTTP request handlers

pub mod deploy;
pub mod events;
pub mod jobs;
pub mod ports;
pub mod volumes;

use axum::{response::IntoResponse, Json};
use openapi_server::models::{HealthResponse, VersionResponse};

use crate::utils::version_info;

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "dockpanel".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}
