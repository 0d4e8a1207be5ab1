//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Panel settings, read from `<data_dir>/settings.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub log_json: bool,

    /// Also write logs to `<data_dir>/logs`
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Template origin configuration
    #[serde(default)]
    pub templates: TemplateSettings,

    /// Container runtime configuration
    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// Port allocation configuration
    #[serde(default)]
    pub ports: PortSettings,

    /// Volume browsing session configuration
    #[serde(default)]
    pub sessions: SessionSettings,

    /// Capacity of each job's live log channel
    #[serde(default = "default_job_log_capacity")]
    pub job_log_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_job_log_capacity() -> usize {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: true,
            server: ServerSettings::default(),
            templates: TemplateSettings::default(),
            runtime: RuntimeSettings::default(),
            ports: PortSettings::default(),
            sessions: SessionSettings::default(),
            job_log_capacity: default_job_log_capacity(),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Template origin settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSettings {
    /// Base URL of the template origin
    #[serde(default = "default_origin_url")]
    pub origin_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_origin_timeout")]
    pub timeout_secs: u64,
}

fn default_origin_url() -> String {
    "https://templates.dockpanel.dev".to_string()
}

fn default_origin_timeout() -> u64 {
    6
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            origin_url: default_origin_url(),
            timeout_secs: default_origin_timeout(),
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Runtime CLI binary
    #[serde(default = "default_runtime_binary")]
    pub binary: String,

    /// Timeout for single runtime calls in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_call_timeout() -> u64 {
    20
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

/// Port allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    /// First port of the allocation window
    #[serde(default = "default_alloc_start")]
    pub alloc_start: u16,

    /// Last port of the allocation window (inclusive)
    #[serde(default = "default_alloc_end")]
    pub alloc_end: u16,
}

fn default_alloc_start() -> u16 {
    55500
}

fn default_alloc_end() -> u16 {
    56000
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            alloc_start: default_alloc_start(),
            alloc_end: default_alloc_end(),
        }
    }
}

/// Volume browsing session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Helper image serving the volume
    #[serde(default = "default_helper_image")]
    pub helper_image: String,

    /// Idle time before a session is reaped, in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Reaper tick, in seconds
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_helper_image() -> String {
    "filebrowser/filebrowser:latest".to_string()
}

fn default_session_ttl() -> u64 {
    120
}

fn default_reaper_interval() -> u64 {
    30
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            helper_image: default_helper_image(),
            ttl_secs: default_session_ttl(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}
