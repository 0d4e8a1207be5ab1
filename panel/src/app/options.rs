//! Application configuration options

use std::time::Duration;

use crate::deploy::{pipeline, templates};
use crate::events::store;
use crate::ports::engine;
use crate::runtime::docker;
use crate::sessions::supervisor;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::{event_watcher, reaper};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub storage: StorageLayout,

    /// Enable the HTTP server
    pub enable_socket_server: bool,

    /// Enable the session reaper
    pub enable_reaper: bool,

    /// Enable the runtime event watcher
    pub enable_event_watcher: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Container runtime CLI
    pub runtime: docker::Options,

    /// Template store
    pub templates: templates::Options,

    /// Deployment pipeline
    pub deployer: pipeline::Options,

    /// Port allocation window
    pub ports: engine::Options,

    /// Volume browsing sessions
    pub sessions: supervisor::Options,

    /// Timeout for connecting to helper containers
    pub proxy_connect_timeout: Duration,

    /// Runtime event log
    pub events: store::Options,

    /// Session reaper worker
    pub reaper: reaper::Options,

    /// Runtime event watcher worker
    pub event_watcher: event_watcher::Options,

    /// Capacity of each job's live log channel
    pub job_log_capacity: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageLayout::default(),
            enable_socket_server: true,
            enable_reaper: true,
            enable_event_watcher: true,
            server: ServerOptions::default(),
            runtime: docker::Options::default(),
            templates: templates::Options::default(),
            deployer: pipeline::Options::default(),
            ports: engine::Options::default(),
            sessions: supervisor::Options::default(),
            proxy_connect_timeout: Duration::from_secs(5),
            events: store::Options::default(),
            reaper: reaper::Options::default(),
            event_watcher: event_watcher::Options::default(),
            job_log_capacity: 100,
        }
    }
}

impl AppOptions {
    /// Options for a data directory and its settings file
    pub fn from_settings(settings: &Settings, storage: StorageLayout) -> Self {
        let defaults = Self::default();
        Self {
            storage,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            runtime: docker::Options {
                binary: settings.runtime.binary.clone(),
                call_timeout: Duration::from_secs(settings.runtime.call_timeout_secs),
                ..defaults.runtime
            },
            templates: templates::Options {
                origin_url: Some(settings.templates.origin_url.clone()),
                request_timeout: Duration::from_secs(settings.templates.timeout_secs),
                ..defaults.templates
            },
            ports: engine::Options {
                alloc_start: settings.ports.alloc_start,
                alloc_end: settings.ports.alloc_end,
            },
            sessions: supervisor::Options {
                helper_image: settings.sessions.helper_image.clone(),
                ttl: Duration::from_secs(settings.sessions.ttl_secs),
                ..defaults.sessions
            },
            reaper: reaper::Options {
                interval: Duration::from_secs(settings.sessions.reaper_interval_secs),
            },
            job_log_capacity: settings.job_log_capacity,
            ..defaults
        }
    }
}

/// Lifecycle options for the panel
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3080,
        }
    }
}
