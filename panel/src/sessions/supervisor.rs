//! Volume browsing sessions backed by disposable helper containers

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use openapi_server::models::SessionStartResponse;
use tracing::{debug, info, warn};

use crate::errors::PanelError;
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, MANAGED_LABEL, ROLE_LABEL, SESSION_LABEL,
    VOLUME_LABEL,
};
use crate::utils::random_token;

/// Role label value of helper containers
pub const HELPER_ROLE: &str = "volume-browser";
/// Port the helper serves on inside its container
pub const HELPER_PORT: u16 = 80;
/// Where the browsed volume is mounted inside the helper
pub const MOUNT_PATH: &str = "/srv";
/// Externally visible path every session lives under
pub const BROWSE_BASE_PATH: &str = "/api/volumes/browse";

/// Path prefix the helper of `session_id` is served under
pub fn session_prefix(session_id: &str) -> String {
    format!("{}/{}/fb", BROWSE_BASE_PATH, session_id)
}

/// Session supervisor options
#[derive(Debug, Clone)]
pub struct Options {
    pub helper_image: String,
    /// Sessions not seen for longer than this are closed
    pub ttl: Duration,
    /// Address resolution attempts after the helper started
    pub resolve_attempts: u32,
    pub resolve_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            helper_image: "filebrowser/filebrowser:latest".to_string(),
            ttl: Duration::from_secs(120),
            resolve_attempts: 15,
            resolve_interval: Duration::from_millis(200),
        }
    }
}

/// A live browsing session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub volume: String,
    pub container_id: String,
    /// `host:port` the helper answers on
    pub address: String,
    pub read_only: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of one reaper tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Sessions closed for being idle past the TTL
    pub expired: Vec<String>,
    /// Helper containers removed by orphan reconciliation
    pub orphans: Vec<String>,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, Session>,
    /// Ids whose helper is being created, with the time the launch began.
    /// Their helpers are not orphans until the entry is older than the TTL.
    starting: HashMap<String, DateTime<Utc>>,
}

fn lock_table(table: &Mutex<SessionTable>) -> MutexGuard<'_, SessionTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Why a helper container found in the runtime should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrphanReason {
    Unlabeled,
    UnknownSession,
    ContainerMismatch,
    Expired,
}

/// Owns the session table and the helper containers behind it
pub struct SessionSupervisor {
    options: Options,
    runtime: Arc<dyn ContainerRuntime>,
    table: Arc<Mutex<SessionTable>>,
}

fn valid_volume_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Address of the helper's published port, falling back to its network IPs
fn pick_address(info: &ContainerInfo) -> Option<String> {
    if let Some(port) = info
        .ports
        .iter()
        .find(|p| p.container_port == HELPER_PORT && p.host_port != 0)
    {
        let host = match port.host_ip.as_str() {
            "" | "0.0.0.0" | "::" => "127.0.0.1",
            ip => ip,
        };
        return Some(format!("{}:{}", host, port.host_port));
    }
    if !info.ip_address.is_empty() {
        return Some(format!("{}:{}", info.ip_address, HELPER_PORT));
    }
    info.network_ips
        .iter()
        .find(|ip| !ip.is_empty())
        .map(|ip| format!("{}:{}", ip, HELPER_PORT))
}

/// Create, start and register the helper of session `id`. A helper that
/// fails to come up, or whose session was given up on by the reaper in the
/// meantime, is removed again.
async fn launch_session(
    options: Options,
    runtime: Arc<dyn ContainerRuntime>,
    table: Arc<Mutex<SessionTable>>,
    id: String,
    volume: String,
    read_only: bool,
) -> Result<Session, PanelError> {
    let (container_id, address) =
        match launch(runtime.as_ref(), &options, &id, &volume, read_only).await {
            Ok(launched) => launched,
            Err(e) => {
                lock_table(&table).starting.remove(&id);
                return Err(e);
            }
        };

    let now = Utc::now();
    let session = Session {
        id: id.clone(),
        volume,
        container_id,
        address,
        read_only,
        created_at: now,
        last_seen: now,
    };
    let registered = {
        let mut table = lock_table(&table);
        if table.starting.remove(&id).is_some() {
            table.sessions.insert(id.clone(), session.clone());
            true
        } else {
            false
        }
    };
    if !registered {
        warn!("Session {} was abandoned while starting, removing helper {}", id, session.container_id);
        if let Err(e) = runtime.remove_container(&session.container_id).await {
            warn!("Failed to remove helper {}: {}", session.container_id, e);
        }
        return Err(PanelError::SessionError(format!("session {} expired while starting", id)));
    }
    Ok(session)
}

async fn launch(
    runtime: &dyn ContainerRuntime,
    options: &Options,
    id: &str,
    volume: &str,
    read_only: bool,
) -> Result<(String, String), PanelError> {
    let spec = ContainerSpec {
        image: options.helper_image.clone(),
        name: format!("dockpanel-volume-browser-{}", id),
        labels: HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (ROLE_LABEL.to_string(), HELPER_ROLE.to_string()),
            (SESSION_LABEL.to_string(), id.to_string()),
            (VOLUME_LABEL.to_string(), volume.to_string()),
        ]),
        env: vec![
            ("FB_NOAUTH".to_string(), "true".to_string()),
            ("FB_BASEURL".to_string(), session_prefix(id)),
        ],
        exposed_port: HELPER_PORT,
        volume: volume.to_string(),
        mount_path: MOUNT_PATH.to_string(),
        read_only,
    };

    let container_id = runtime.create_container(&spec).await?;
    let ready = async {
        runtime.start_container(&container_id).await?;
        resolve_address(runtime, options, &container_id).await
    }
    .await;

    match ready {
        Ok(address) => Ok((container_id, address)),
        Err(e) => {
            warn!("Helper {} failed to come up: {}", container_id, e);
            if let Err(remove_err) = runtime.remove_container(&container_id).await {
                warn!("Failed to remove helper {}: {}", container_id, remove_err);
            }
            Err(e)
        }
    }
}

async fn resolve_address(
    runtime: &dyn ContainerRuntime,
    options: &Options,
    container_id: &str,
) -> Result<String, PanelError> {
    for attempt in 0..options.resolve_attempts {
        match runtime.inspect_container(container_id).await {
            Ok(info) => {
                if let Some(address) = pick_address(&info) {
                    return Ok(address);
                }
            }
            Err(e) => debug!("Inspect of helper {} failed (attempt {}): {}", container_id, attempt, e),
        }
        tokio::time::sleep(options.resolve_interval).await;
    }
    Err(PanelError::SessionError(format!(
        "helper {} did not expose an address",
        container_id
    )))
}

impl SessionSupervisor {
    pub fn new(options: Options, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            options,
            runtime,
            table: Arc::new(Mutex::new(SessionTable::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        lock_table(&self.table)
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.options.ttl).unwrap_or(chrono::Duration::MAX)
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.last_seen) > self.ttl()
    }

    /// Start a helper serving `volume` and register its session
    pub async fn start(&self, volume: &str) -> Result<SessionStartResponse, PanelError> {
        let volume = volume.trim();
        if !valid_volume_name(volume) {
            return Err(PanelError::ValidationError(format!("invalid volume name: {}", volume)));
        }
        if !self.runtime.volume_exists(volume).await? {
            return Err(PanelError::NotFound(format!("volume {} not found", volume)));
        }

        let read_only = self.volume_in_use(volume).await;

        if !self.runtime.image_exists(&self.options.helper_image).await? {
            info!("Pulling helper image {}", self.options.helper_image);
            self.runtime.pull_image(&self.options.helper_image).await?;
        }

        let id = random_token();
        self.lock().starting.insert(id.clone(), Utc::now());

        // Detached so that a dropped caller still ends with the helper
        // either registered or removed
        let task = tokio::spawn(launch_session(
            self.options.clone(),
            self.runtime.clone(),
            self.table.clone(),
            id.clone(),
            volume.to_string(),
            read_only,
        ));
        task.await.map_err(|e| {
            PanelError::SessionError(format!("launch of session {} aborted: {}", id, e))
        })??;

        info!("Started browsing session {} for volume {} (read-only: {})", id, volume, read_only);
        Ok(SessionStartResponse {
            url: format!("{}/", session_prefix(&id)),
            session_id: id,
            read_only,
        })
    }

    /// A volume mounted by any container is only browsed read-only. A failed
    /// scan counts as in use.
    async fn volume_in_use(&self, volume: &str) -> bool {
        match self.runtime.list_containers(true, None).await {
            Ok(containers) => containers
                .iter()
                .any(|c| c.mounts.iter().any(|m| m.kind == "volume" && m.name == volume)),
            Err(e) => {
                warn!("Could not scan mounts of volume {}: {}", volume, e);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().sessions.get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Refresh a session's last-seen time, returning the session
    pub fn touch(&self, id: &str) -> Result<Session, PanelError> {
        let mut table = self.lock();
        let session = table
            .sessions
            .get_mut(id)
            .ok_or_else(|| PanelError::NotFound(format!("session {} not found", id)))?;
        session.last_seen = Utc::now();
        Ok(session.clone())
    }

    pub fn heartbeat(&self, id: &str) -> Result<(), PanelError> {
        self.touch(id).map(|_| ())
    }

    /// Forget a session and remove its helper
    pub async fn close(&self, id: &str) -> Result<(), PanelError> {
        let session = self
            .lock()
            .sessions
            .remove(id)
            .ok_or_else(|| PanelError::NotFound(format!("session {} not found", id)))?;
        self.runtime.remove_container(&session.container_id).await?;
        info!("Closed browsing session {} ({})", id, session.volume);
        Ok(())
    }

    /// Close every session, used on shutdown
    pub async fn close_all(&self) {
        let sessions: Vec<Session> = self.lock().sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = self.runtime.remove_container(&session.container_id).await {
                warn!("Failed to remove helper of session {}: {}", session.id, e);
            }
        }
    }

    /// One reaper tick: close idle sessions, then remove helper containers
    /// that no fresh session accounts for.
    pub async fn reap_once(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        let expired: Vec<Session> = {
            let mut table = self.lock();
            let ids: Vec<String> = table
                .sessions
                .values()
                .filter(|s| self.is_expired(s, now))
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| table.sessions.remove(id)).collect()
        };
        for session in expired {
            info!("Session {} idle past TTL, closing", session.id);
            if let Err(e) = self.runtime.remove_container(&session.container_id).await {
                warn!("Failed to remove helper of session {}: {}", session.id, e);
            }
            report.expired.push(session.id);
        }

        let label = format!("{}={}", ROLE_LABEL, HELPER_ROLE);
        let helpers = match self.runtime.list_containers(true, Some(&label)).await {
            Ok(helpers) => helpers,
            Err(e) => {
                warn!("Could not list helper containers: {}", e);
                return report;
            }
        };

        let orphans: Vec<(ContainerInfo, OrphanReason)> = {
            let mut table = self.lock();
            let ttl = self.ttl();
            table.starting.retain(|id, since| {
                let fresh = now.signed_duration_since(*since) <= ttl;
                if !fresh {
                    warn!("Session {} still starting past the TTL, giving up on it", id);
                }
                fresh
            });
            helpers
                .into_iter()
                .filter_map(|c| self.orphan_reason(&table, &c, now).map(|r| (c, r)))
                .collect()
        };
        for (container, reason) in orphans {
            info!("Removing orphan helper {} ({:?})", container.id, reason);
            match self.runtime.remove_container(&container.id).await {
                Ok(()) => report.orphans.push(container.id),
                Err(e) => warn!("Failed to remove orphan helper {}: {}", container.id, e),
            }
        }

        report
    }

    fn orphan_reason(
        &self,
        table: &SessionTable,
        container: &ContainerInfo,
        now: DateTime<Utc>,
    ) -> Option<OrphanReason> {
        let Some(session_id) = container.label(SESSION_LABEL).filter(|s| !s.is_empty()) else {
            return Some(OrphanReason::Unlabeled);
        };
        if table.starting.contains_key(session_id) {
            return None;
        }
        match table.sessions.get(session_id) {
            None => Some(OrphanReason::UnknownSession),
            Some(session) if session.container_id != container.id => {
                Some(OrphanReason::ContainerMismatch)
            }
            Some(session) if self.is_expired(session, now) => Some(OrphanReason::Expired),
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PublishedPort;

    #[test]
    fn test_pick_address_prefers_published_port() {
        let info = ContainerInfo {
            ports: vec![PublishedPort {
                host_ip: "127.0.0.1".to_string(),
                host_port: 49153,
                container_port: 80,
                protocol: "tcp".to_string(),
            }],
            ip_address: "172.17.0.5".to_string(),
            ..Default::default()
        };
        assert_eq!(pick_address(&info).as_deref(), Some("127.0.0.1:49153"));

        let info = ContainerInfo {
            ip_address: "172.17.0.5".to_string(),
            ..Default::default()
        };
        assert_eq!(pick_address(&info).as_deref(), Some("172.17.0.5:80"));

        let info = ContainerInfo {
            network_ips: vec!["".to_string(), "10.0.0.2".to_string()],
            ..Default::default()
        };
        assert_eq!(pick_address(&info).as_deref(), Some("10.0.0.2:80"));

        assert_eq!(pick_address(&ContainerInfo::default()), None);
    }

    #[test]
    fn test_volume_names() {
        assert!(valid_volume_name("my_data-1.0"));
        assert!(!valid_volume_name(""));
        assert!(!valid_volume_name("../etc"));
        assert!(!valid_volume_name("a b"));
    }

    #[test]
    fn test_session_prefix() {
        assert_eq!(session_prefix("abc"), "/api/volumes/browse/abc/fb");
    }
}
