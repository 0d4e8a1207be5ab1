//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::templates::TemplateStore;
use crate::deploy::Deployer;
use crate::errors::PanelError;
use crate::events::EventStore;
use crate::jobs::JobRegistry;
use crate::ports::usage::{NetstatTable, SocketTable};
use crate::ports::PortEngine;
use crate::runtime::docker::DockerCli;
use crate::runtime::ContainerRuntime;
use crate::server::state::ServerState;
use crate::sessions::{SessionProxy, SessionSupervisor};
use crate::storage::ledger::PortLedger;

/// Main application state
pub struct AppState {
    /// Container runtime shared by every component
    pub runtime: Arc<dyn ContainerRuntime>,

    /// Port settings, notes and reservations
    pub ledger: Arc<PortLedger>,

    /// In-memory job registry
    pub jobs: Arc<JobRegistry>,

    /// Template resolution and cache
    pub templates: Arc<TemplateStore>,

    /// Deployment pipeline
    pub deployer: Arc<Deployer>,

    /// Port query and allocation
    pub ports: Arc<PortEngine>,

    /// Volume browsing sessions
    pub sessions: Arc<SessionSupervisor>,

    /// Reverse proxy into session helpers
    pub proxy: Arc<SessionProxy>,

    /// Runtime event log
    pub events: Arc<EventStore>,
}

impl AppState {
    /// Initialize application state against the docker CLI and the host socket table
    pub async fn init(options: &AppOptions) -> Result<Self, PanelError> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(options.runtime.clone()));
        let sockets: Arc<dyn SocketTable> = Arc::new(NetstatTable::new(options.runtime.call_timeout));
        Self::with_collaborators(options, runtime, sockets).await
    }

    /// Initialize application state with the given runtime and socket table
    pub async fn with_collaborators(
        options: &AppOptions,
        runtime: Arc<dyn ContainerRuntime>,
        sockets: Arc<dyn SocketTable>,
    ) -> Result<Self, PanelError> {
        info!("Initializing application state...");

        let layout = &options.storage;
        layout.setup().await?;

        let ledger = Arc::new(PortLedger::open(layout.database_file().path())?);
        let jobs = Arc::new(JobRegistry::new(options.job_log_capacity));
        let templates = Arc::new(TemplateStore::new(
            options.templates.clone(),
            layout.templates_cache_dir(),
        )?);

        let deployer = Arc::new(Deployer::new(
            options.deployer.clone(),
            jobs.clone(),
            runtime.clone(),
            templates.clone(),
            ledger.clone(),
            layout.projects_dir(),
        ));

        let ports = Arc::new(PortEngine::new(
            options.ports.clone(),
            ledger.clone(),
            sockets,
            runtime.clone(),
        ));

        let sessions = Arc::new(SessionSupervisor::new(
            options.sessions.clone(),
            runtime.clone(),
        ));
        let proxy = Arc::new(SessionProxy::new(options.proxy_connect_timeout)?);
        let events = Arc::new(EventStore::new(layout.events_file(), options.events.clone()));

        Ok(Self {
            runtime,
            ledger,
            jobs,
            templates,
            deployer,
            ports,
            sessions,
            proxy,
            events,
        })
    }

    /// State handed to the HTTP handlers
    pub fn server_state(&self) -> ServerState {
        ServerState::new(
            self.jobs.clone(),
            self.deployer.clone(),
            self.ports.clone(),
            self.sessions.clone(),
            self.proxy.clone(),
            self.events.clone(),
        )
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), PanelError> {
        info!("Shutting down application state...");
        self.sessions.close_all().await;
        Ok(())
    }
}
