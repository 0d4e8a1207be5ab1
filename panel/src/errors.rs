//! Error types for the panel

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Main error type for the panel
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Runtime call timed out: {0}")]
    RuntimeTimeout(String),

    #[error("Deployment error: {0}")]
    DeployError(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for PanelError {
    fn from(err: anyhow::Error) -> Self {
        PanelError::Internal(err.to_string())
    }
}

impl PanelError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PanelError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PanelError::NotFound(_) => StatusCode::NOT_FOUND,
            PanelError::Conflict(_) => StatusCode::CONFLICT,
            PanelError::ProxyError(_) | PanelError::HttpError(_) => StatusCode::BAD_GATEWAY,
            PanelError::RuntimeTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
