//! Panel API models

use std::collections::HashMap;

use openapi_client::models::DeploymentParameter;
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Generic acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ================================= JOBS ===================================== //

/// Job summary as listed by `GET /api/jobs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub error: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub log_count: usize,
    pub dropped_log_count: u64,
}

/// Response of any endpoint that submits a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmitted {
    pub task_id: String,
}

// ================================= DEPLOY ===================================== //

/// Body of `POST /api/templates/{id}/deploy` and `POST /api/projects/{name}/redeploy`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// Overrides the template manifest when non-empty
    #[serde(default)]
    pub compose: String,
    /// Legacy raw environment pairs
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Overrides the template `.env` when non-empty
    #[serde(default)]
    pub dotenv: String,
    /// Structured parameters, same shape as the template schema
    #[serde(default)]
    pub config: Vec<DeploymentParameter>,
    #[serde(default)]
    pub project_name: String,
}

/// Result payload of a successful deployment job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
    pub app_id: String,
    pub project: String,
}

// ================================= PORTS ===================================== //

/// A merged (run-length compressed) port record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub end_port: u16,
    /// "Host", "Container" or empty for unused ports
    #[serde(rename = "type")]
    pub port_type: String,
    pub protocol: String,
    pub used: bool,
    pub note: String,
    pub service: String,
}

/// Response of `GET /api/ports`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortQueryResponse {
    pub items: Vec<PortRecord>,
    pub total: usize,
    pub used: usize,
    pub available: usize,
    #[serde(rename = "range_start")]
    pub range_start: u16,
    #[serde(rename = "range_end")]
    pub range_end: u16,
    #[serde(rename = "protocol_filter")]
    pub protocol_filter: String,
    #[serde(rename = "type_filter")]
    pub type_filter: String,
    pub page: usize,
    pub page_size: usize,
}

/// Configured scan window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    /// "TCP", "UDP" or "TCP+UDP"
    pub protocol: String,
}

/// Body of `POST /api/ports/note`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortNoteRequest {
    pub port: u16,
    #[serde(rename = "type", default)]
    pub port_type: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub note: String,
}

/// Body of `POST /api/ports/allocate`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub counts: Vec<i64>,
    #[serde(default)]
    pub protocol: String,
    #[serde(rename = "type", default)]
    pub port_type: String,
    #[serde(default)]
    pub reserved_by: String,
    #[serde(default)]
    pub use_alloc_range: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// Response of `POST /api/ports/allocate`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    pub segments: Vec<Vec<u16>>,
    pub protocol: String,
    #[serde(rename = "type")]
    pub port_type: String,
    pub reserved_by: String,
    pub dry_run: bool,
    pub range_start: u16,
    pub range_end: u16,
}

// ================================= VOLUMES ===================================== //

/// Response of `POST /api/volumes/{name}/browse`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartResponse {
    pub session_id: String,
    pub url: String,
    pub read_only: bool,
}

// ================================= EVENTS ===================================== //

/// Stored runtime lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub id: String,
    /// success, warning, error or info
    #[serde(rename = "type")]
    pub level: String,
    /// success, warning, danger or info
    pub type_class: String,
    /// Local wall-clock time, `HH:MM:SS`
    pub time: String,
    pub message: String,
    /// Unix seconds
    pub timestamp: i64,
}
