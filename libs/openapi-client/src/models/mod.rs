//! Template origin models

use serde::{Deserialize, Serialize};

/// Application template as served by the origin (`GET {base}/api/templates/{key}`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub logo: String,
    /// Raw `.env` text shipped with the template
    #[serde(default)]
    pub dotenv: String,
    /// Compose manifest text
    #[serde(default)]
    pub compose: String,
    /// Deployment parameters the template accepts
    #[serde(default)]
    pub schema: Vec<DeploymentParameter>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub deployment_count: u64,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_true() -> bool {
    true
}

impl Template {
    /// Whether this template answers to the given id or name
    pub fn matches(&self, id_or_name: &str) -> bool {
        self.name == id_or_name || self.id.to_string() == id_or_name
    }
}

/// One configurable parameter of a template.
///
/// For `port` and `path` parameters `name` is the host side and `default` the
/// container side (`host:container`). For `env` parameters `name` is the key and
/// `default` the value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentParameter {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub service_name: String,
    /// port, path, volume, env, environment, hardware, other
    #[serde(default)]
    pub param_type: String,
}
