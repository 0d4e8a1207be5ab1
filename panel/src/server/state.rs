//! Server state

use std::sync::Arc;
use std::time::Duration;

use crate::deploy::Deployer;
use crate::events::EventStore;
use crate::jobs::JobRegistry;
use crate::ports::PortEngine;
use crate::sessions::{SessionProxy, SessionSupervisor};

/// Server state shared across handlers
pub struct ServerState {
    pub jobs: Arc<JobRegistry>,
    pub deployer: Arc<Deployer>,
    pub ports: Arc<PortEngine>,
    pub sessions: Arc<SessionSupervisor>,
    pub proxy: Arc<SessionProxy>,
    pub events: Arc<EventStore>,
    /// Interval of SSE keep-alive comments
    pub sse_keep_alive: Duration,
}

impl ServerState {
    pub fn new(
        jobs: Arc<JobRegistry>,
        deployer: Arc<Deployer>,
        ports: Arc<PortEngine>,
        sessions: Arc<SessionSupervisor>,
        proxy: Arc<SessionProxy>,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            jobs,
            deployer,
            ports,
            sessions,
            proxy,
            events,
            sse_keep_alive: Duration::from_secs(15),
        }
    }
}
