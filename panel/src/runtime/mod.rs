//! Container runtime seam
//!
//! Everything the panel needs from the container runtime goes through
//! [`ContainerRuntime`]. The production implementation drives the runtime CLI
//! ([`docker::DockerCli`]); tests substitute an in-memory fake.

pub mod docker;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::errors::PanelError;

/// Label carried by every container the panel creates for itself
pub const MANAGED_LABEL: &str = "dockpanel.managed";
/// Role of a managed container
pub const ROLE_LABEL: &str = "dockpanel.role";
/// Owning session of a helper container
pub const SESSION_LABEL: &str = "dockpanel.session";
/// Volume served by a helper container
pub const VOLUME_LABEL: &str = "dockpanel.volume";
/// Label the compose tooling puts on project containers
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// A volume or bind mount of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// "volume", "bind", "tmpfs"
    pub kind: String,
    /// Volume name, empty for bind mounts
    pub name: String,
    pub source: String,
    pub destination: String,
}

/// A container port published on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    /// "tcp" or "udp"
    pub protocol: String,
}

/// What the panel needs to know about a container
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PublishedPort>,
    /// Address on the default bridge network
    pub ip_address: String,
    /// Addresses on user-defined networks
    pub network_ips: Vec<String>,
}

impl ContainerInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Container creation request for a helper container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    /// Container name, empty lets the runtime pick one
    pub name: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<(String, String)>,
    /// Container port published on an OS-assigned loopback port
    pub exposed_port: u16,
    pub volume: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// A lifecycle notification from the runtime event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Object type, e.g. "container"
    pub kind: String,
    /// e.g. "start", "die", "destroy"
    pub action: String,
    pub actor_id: String,
    pub actor_name: String,
    pub time_nano: i64,
}

/// Chunks of compose output, stdout and stderr interleaved
pub type OutputSender = mpsc::Sender<Vec<u8>>;

/// Operations the panel performs against the container runtime.
///
/// Implementations apply their own call timeouts.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers, or all containers when `all` is set. With a
    /// `label` filter only containers carrying that label (`key` or `key=value`)
    /// are returned.
    async fn list_containers(
        &self,
        all: bool,
        label: Option<&str>,
    ) -> Result<Vec<ContainerInfo>, PanelError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, PanelError>;

    async fn volume_exists(&self, name: &str) -> Result<bool, PanelError>;

    async fn image_exists(&self, image: &str) -> Result<bool, PanelError>;

    /// Pull an image, reading at most a bounded amount of progress output
    async fn pull_image(&self, image: &str) -> Result<(), PanelError>;

    /// Create (not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, PanelError>;

    async fn start_container(&self, id: &str) -> Result<(), PanelError>;

    /// Force-remove a container together with its anonymous volumes
    async fn remove_container(&self, id: &str) -> Result<(), PanelError>;

    /// Stream of container events between `since` and `until`. Without
    /// `until` the stream follows live events until dropped.
    async fn events(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<BoxStream<'static, Result<RuntimeEvent, PanelError>>, PanelError>;

    /// Bring a compose project up, forwarding its output
    async fn compose_up(
        &self,
        dir: &Path,
        project: &str,
        output: OutputSender,
    ) -> Result<(), PanelError>;

    async fn compose_down(&self, dir: &Path, project: &str) -> Result<(), PanelError>;
}
