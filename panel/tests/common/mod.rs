//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use dockpanel::app::options::AppOptions;
use dockpanel::app::state::AppState;
use dockpanel::errors::PanelError;
use dockpanel::ports::usage::{ListeningSocket, SocketTable};
use dockpanel::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, Mount, OutputSender, PublishedPort,
    RuntimeEvent, COMPOSE_PROJECT_LABEL, ROLE_LABEL,
};
use dockpanel::sessions::supervisor::HELPER_ROLE;
use dockpanel::storage::layout::StorageLayout;

#[derive(Default)]
struct FakeState {
    containers: Vec<ContainerInfo>,
    volumes: HashSet<String>,
    events: Vec<RuntimeEvent>,
    removed: Vec<String>,
    next_id: u32,
}

/// In-memory container runtime.
///
/// `compose_up` creates one container per project publishing `compose_ports`,
/// or, with `compose_fails` set, creates it and then fails. With
/// `start_hangs` set `start_container` never returns, and with `no_address`
/// inspected containers carry neither ports nor IPs.
#[derive(Default)]
pub struct FakeRuntime {
    pub(crate) state: Mutex<FakeState>,
    pub start_hangs: bool,
    pub no_address: bool,
    pub compose_fails: bool,
    pub compose_ports: Vec<u16>,
    pub compose_output: Vec<String>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn next_id(state: &mut FakeState) -> String {
        state.next_id += 1;
        format!("c{:04}", state.next_id)
    }

    pub fn add_volume(&self, name: &str) {
        self.lock().volumes.insert(name.to_string());
    }

    /// Add a running container, returning its id
    pub fn add_container(&self, mut info: ContainerInfo) -> String {
        let mut state = self.lock();
        if info.id.is_empty() {
            info.id = Self::next_id(&mut state);
        }
        let id = info.id.clone();
        state.containers.push(info);
        id
    }

    pub fn add_event(&self, event: RuntimeEvent) {
        self.lock().events.push(event);
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.lock().containers.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn helpers(&self) -> Vec<ContainerInfo> {
        self.containers()
            .into_iter()
            .filter(|c| c.label(ROLE_LABEL) == Some(HELPER_ROLE))
            .collect()
    }

    pub fn project_containers(&self, project: &str) -> Vec<ContainerInfo> {
        self.containers()
            .into_iter()
            .filter(|c| c.label(COMPOSE_PROJECT_LABEL) == Some(project))
            .collect()
    }
}

fn matches_label(info: &ContainerInfo, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => info.label(key) == Some(value),
        None => info.labels.contains_key(filter),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(
        &self,
        all: bool,
        label: Option<&str>,
    ) -> Result<Vec<ContainerInfo>, PanelError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| all || c.running)
            .filter(|c| label.map(|l| matches_label(c, l)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, PanelError> {
        let mut info = self
            .lock()
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| PanelError::NotFound(format!("container {}", id)))?;
        if self.no_address {
            info.ports.clear();
            info.ip_address.clear();
            info.network_ips.clear();
        }
        Ok(info)
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, PanelError> {
        Ok(self.lock().volumes.contains(name))
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, PanelError> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> Result<(), PanelError> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, PanelError> {
        let mut state = self.lock();
        let id = Self::next_id(&mut state);
        let ip_address = format!("172.17.0.{}", state.next_id + 1);
        state.containers.push(ContainerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            running: false,
            mounts: vec![Mount {
                kind: "volume".to_string(),
                name: spec.volume.clone(),
                source: String::new(),
                destination: spec.mount_path.clone(),
            }],
            ports: Vec::new(),
            ip_address,
            network_ips: Vec::new(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), PanelError> {
        if self.start_hangs {
            std::future::pending::<()>().await;
        }
        let mut state = self.lock();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| PanelError::NotFound(format!("container {}", id)))?;
        container.running = true;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), PanelError> {
        let mut state = self.lock();
        state.containers.retain(|c| c.id != id);
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn events(
        &self,
        _since: Option<DateTime<Utc>>,
        _until: Option<DateTime<Utc>>,
    ) -> Result<BoxStream<'static, Result<RuntimeEvent, PanelError>>, PanelError> {
        let events = self.lock().events.clone();
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn compose_up(
        &self,
        _dir: &Path,
        project: &str,
        output: OutputSender,
    ) -> Result<(), PanelError> {
        for line in &self.compose_output {
            let _ = output.send(format!("{}\n", line).into_bytes()).await;
        }

        {
            let mut state = self.lock();
            let id = Self::next_id(&mut state);
            state.containers.push(ContainerInfo {
                id,
                name: format!("{}-app-1", project),
                labels: HashMap::from([(COMPOSE_PROJECT_LABEL.to_string(), project.to_string())]),
                running: true,
                ports: self
                    .compose_ports
                    .iter()
                    .map(|&port| PublishedPort {
                        host_ip: "0.0.0.0".to_string(),
                        host_port: port,
                        container_port: port,
                        protocol: "tcp".to_string(),
                    })
                    .collect(),
                ..Default::default()
            });
        }

        if self.compose_fails {
            let _ = output.send(b"Error response from daemon: boom\n".to_vec()).await;
            return Err(PanelError::RuntimeError("compose up exited with 1".to_string()));
        }
        Ok(())
    }

    async fn compose_down(&self, _dir: &Path, project: &str) -> Result<(), PanelError> {
        let mut state = self.lock();
        let (gone, kept): (Vec<_>, Vec<_>) = state
            .containers
            .drain(..)
            .partition(|c| c.label(COMPOSE_PROJECT_LABEL) == Some(project));
        state.containers = kept;
        state.removed.extend(gone.into_iter().map(|c| c.id));
        Ok(())
    }
}

/// Socket table with a fixed set of listeners
#[derive(Default)]
pub struct FakeSockets {
    pub sockets: Vec<ListeningSocket>,
}

#[async_trait]
impl SocketTable for FakeSockets {
    async fn listening_sockets(&self) -> Result<Vec<ListeningSocket>, PanelError> {
        Ok(self.sockets.clone())
    }
}

/// Options rooted at `data_dir`, serving templates from the cache only
pub fn test_options(data_dir: &Path) -> AppOptions {
    let mut options = AppOptions {
        storage: StorageLayout::new(data_dir),
        ..Default::default()
    };
    options.templates.origin_url = None;
    options.sessions.resolve_interval = std::time::Duration::from_millis(1);
    options
}

pub async fn test_state(
    data_dir: &Path,
    runtime: Arc<FakeRuntime>,
    sockets: FakeSockets,
) -> AppState {
    AppState::with_collaborators(&test_options(data_dir), runtime, Arc::new(sockets))
        .await
        .unwrap()
}
