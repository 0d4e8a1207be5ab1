//! Runtime implementation driving the docker CLI

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::PanelError;
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, Mount, OutputSender, PublishedPort,
    RuntimeEvent,
};

/// Docker CLI options
#[derive(Debug, Clone)]
pub struct Options {
    /// Binary to invoke
    pub binary: String,

    /// Timeout for short management calls
    pub call_timeout: Duration,

    /// Timeout for image pulls
    pub pull_timeout: Duration,

    /// Timeout for compose up/down
    pub compose_timeout: Duration,

    /// Maximum bytes of pull progress read before the pipe is closed
    pub pull_output_limit: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            call_timeout: Duration::from_secs(20),
            pull_timeout: Duration::from_secs(300),
            compose_timeout: Duration::from_secs(1800),
            pull_output_limit: 2 * 1024 * 1024,
        }
    }
}

/// [`ContainerRuntime`] backed by the docker CLI
pub struct DockerCli {
    options: Options,
}

impl DockerCli {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.options.binary);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    async fn output<I, S>(&self, args: I, timeout: Duration) -> Result<Output, PanelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command();
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        let what = format!("{:?}", cmd.as_std());

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(PanelError::RuntimeTimeout(what)),
        }
    }

    async fn checked<I, S>(&self, args: I, what: &str) -> Result<Output, PanelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.output(args, self.options.call_timeout).await?;
        if !output.status.success() {
            return Err(PanelError::RuntimeError(format!(
                "{}: {}",
                what,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    fn compose_base(&self, dir: &Path, project: &str) -> Command {
        let mut cmd = self.command();
        cmd.current_dir(dir)
            .args(["compose", "-p", project])
            .env("COMPOSE_PROGRESS", "plain")
            .env("COMPOSE_NO_COLOR", "1");
        if dir.join(".env").is_file() {
            cmd.args(["--env-file", ".env"]);
        }
        cmd
    }
}

fn is_not_found(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr)
        .to_lowercase()
        .contains("no such")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_containers(
        &self,
        all: bool,
        label: Option<&str>,
    ) -> Result<Vec<ContainerInfo>, PanelError> {
        let mut args = vec!["ps".to_string(), "-q".to_string(), "--no-trunc".to_string()];
        if all {
            args.push("-a".to_string());
        }
        if let Some(label) = label {
            args.push("--filter".to_string());
            args.push(format!("label={}", label));
        }
        let output = self.checked(&args, "list containers").await?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // containers may disappear between ps and inspect; keep what inspect found
        let mut args = vec!["inspect".to_string()];
        args.extend(ids);
        let output = self.output(&args, self.options.call_timeout).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim_start().starts_with('[') {
            return Err(PanelError::RuntimeError(format!(
                "inspect containers: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_inspect(&stdout)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, PanelError> {
        let output = self
            .output(["inspect", "--type", "container", id], self.options.call_timeout)
            .await?;
        if !output.status.success() {
            if is_not_found(&output.stderr) {
                return Err(PanelError::NotFound(format!("container {}", id)));
            }
            return Err(PanelError::RuntimeError(format!(
                "inspect container {}: {}",
                id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))?
            .into_iter()
            .next()
            .ok_or_else(|| PanelError::NotFound(format!("container {}", id)))
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, PanelError> {
        let output = self
            .output(["volume", "inspect", name], self.options.call_timeout)
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_not_found(&output.stderr) {
            return Ok(false);
        }
        Err(PanelError::RuntimeError(format!(
            "inspect volume {}: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, PanelError> {
        let output = self
            .output(["image", "inspect", image], self.options.call_timeout)
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_not_found(&output.stderr) {
            return Ok(false);
        }
        Err(PanelError::RuntimeError(format!(
            "inspect image {}: {}",
            image,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    async fn pull_image(&self, image: &str) -> Result<(), PanelError> {
        debug!("Pulling image {}", image);
        let mut child = self
            .command()
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let limit = self.options.pull_output_limit;
        let pull = async {
            if let Some(stdout) = child.stdout.take() {
                let mut limited = stdout.take(limit);
                tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
            }
            child.wait().await
        };

        let status = match tokio::time::timeout(self.options.pull_timeout, pull).await {
            Ok(status) => status?,
            Err(_) => return Err(PanelError::RuntimeTimeout(format!("pull {}", image))),
        };
        if !status.success() {
            return Err(PanelError::RuntimeError(format!(
                "pull {} exited with {}",
                image, status
            )));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, PanelError> {
        let mut args = vec!["create".to_string()];
        if !spec.name.is_empty() {
            args.push("--name".to_string());
            args.push(spec.name.clone());
        }
        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-p".to_string());
        args.push(format!("127.0.0.1:0:{}/tcp", spec.exposed_port));
        let mut mount = format!(
            "type=volume,source={},target={}",
            spec.volume, spec.mount_path
        );
        if spec.read_only {
            mount.push_str(",readonly");
        }
        args.push("--mount".to_string());
        args.push(mount);
        args.push(spec.image.clone());

        let output = self.checked(&args, "create container").await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(PanelError::RuntimeError(
                "create container returned no id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), PanelError> {
        self.checked(["start", id], "start container").await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), PanelError> {
        let output = self
            .output(["rm", "-f", "-v", id], self.options.call_timeout)
            .await?;
        if output.status.success() || is_not_found(&output.stderr) {
            return Ok(());
        }
        Err(PanelError::RuntimeError(format!(
            "remove container {}: {}",
            id,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    async fn events(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<BoxStream<'static, Result<RuntimeEvent, PanelError>>, PanelError> {
        let mut cmd = self.command();
        cmd.args(["events", "--format", "{{json .}}", "--filter", "type=container"]);
        if let Some(since) = since {
            cmd.args(["--since", &since.timestamp().to_string()]);
        }
        if let Some(until) = until {
            cmd.args(["--until", &until.timestamp().to_string()]);
        }
        let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::null()).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PanelError::RuntimeError("events: no stdout".to_string()))?;

        let lines = BufReader::new(stdout).lines();
        // the child rides along in the stream state and is killed when the stream drops
        let stream = stream::unfold((lines, child), |(mut lines, child)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => return Some((parse_event(&line), (lines, child))),
                    Ok(None) => return None,
                    Err(e) => {
                        warn!("Runtime event stream read failed: {}", e);
                        return None;
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn compose_up(
        &self,
        dir: &Path,
        project: &str,
        output: OutputSender,
    ) -> Result<(), PanelError> {
        let mut child = self
            .compose_base(dir, project)
            .args(["up", "-d", "--remove-orphans"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout_task = tokio::spawn(forward_output(child.stdout.take(), output.clone()));
        let stderr_task = tokio::spawn(forward_output(child.stderr.take(), output));

        let waited = tokio::time::timeout(self.options.compose_timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(PanelError::RuntimeTimeout(format!("compose up {}", project)));
            }
        };
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(PanelError::DeployError(format!(
                "compose up exited with {}",
                status
            )));
        }
        Ok(())
    }

    async fn compose_down(&self, dir: &Path, project: &str) -> Result<(), PanelError> {
        let mut cmd = self.compose_base(dir, project);
        cmd.args(["down", "--remove-orphans"])
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = match tokio::time::timeout(self.options.compose_timeout, cmd.output()).await
        {
            Ok(output) => output?,
            Err(_) => return Err(PanelError::RuntimeTimeout(format!("compose down {}", project))),
        };
        if !output.status.success() {
            return Err(PanelError::RuntimeError(format!(
                "compose down {}: {}",
                project,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

async fn forward_output<R>(reader: Option<R>, tx: OutputSender)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}

// =============================== PARSING ================================== //

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: Option<InspectConfig>,
    #[serde(default)]
    state: Option<InspectState>,
    #[serde(default)]
    mounts: Option<Vec<InspectMount>>,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(default, rename = "Type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default, rename = "IPAddress")]
    ip_address: Option<String>,
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectBinding>>>>,
    #[serde(default)]
    networks: Option<HashMap<String, InspectEndpoint>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct InspectEndpoint {
    #[serde(default, rename = "IPAddress")]
    ip_address: Option<String>,
}

pub(crate) fn parse_inspect(json: &str) -> Result<Vec<ContainerInfo>, PanelError> {
    let raw: Vec<InspectContainer> = serde_json::from_str(json)?;
    Ok(raw.into_iter().map(ContainerInfo::from).collect())
}

impl From<InspectContainer> for ContainerInfo {
    fn from(raw: InspectContainer) -> Self {
        let mut ports = Vec::new();
        let mut ip_address = String::new();
        let mut network_ips = Vec::new();

        if let Some(network) = raw.network_settings {
            ip_address = network.ip_address.unwrap_or_default();
            for (key, bindings) in network.ports.unwrap_or_default() {
                let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
                let Ok(container_port) = port.parse::<u16>() else {
                    continue;
                };
                for binding in bindings.unwrap_or_default() {
                    if let Ok(host_port) = binding.host_port.parse::<u16>() {
                        ports.push(PublishedPort {
                            host_ip: binding.host_ip,
                            host_port,
                            container_port,
                            protocol: protocol.to_lowercase(),
                        });
                    }
                }
            }
            let mut networks: Vec<_> = network.networks.unwrap_or_default().into_iter().collect();
            networks.sort_by(|a, b| a.0.cmp(&b.0));
            network_ips = networks
                .into_iter()
                .filter_map(|(_, endpoint)| endpoint.ip_address)
                .filter(|ip| !ip.is_empty())
                .collect();
        }
        ports.sort_by_key(|p| (p.host_port, p.container_port));

        ContainerInfo {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            labels: raw.config.and_then(|c| c.labels).unwrap_or_default(),
            running: raw.state.map(|s| s.running).unwrap_or(false),
            mounts: raw
                .mounts
                .unwrap_or_default()
                .into_iter()
                .map(|m| Mount {
                    kind: m.kind,
                    name: m.name.unwrap_or_default(),
                    source: m.source,
                    destination: m.destination,
                })
                .collect(),
            ports,
            ip_address,
            network_ips,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default, rename = "Type")]
    kind: String,
    #[serde(default, rename = "Action")]
    action: String,
    #[serde(default, rename = "Actor")]
    actor: RawActor,
    #[serde(default)]
    id: String,
    #[serde(default)]
    time: i64,
    #[serde(default, rename = "timeNano")]
    time_nano: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RawActor {
    #[serde(default, rename = "ID")]
    id: String,
    #[serde(default, rename = "Attributes")]
    attributes: HashMap<String, String>,
}

pub(crate) fn parse_event(line: &str) -> Result<RuntimeEvent, PanelError> {
    let raw: RawEvent = serde_json::from_str(line)?;
    let actor_id = if raw.actor.id.is_empty() { raw.id } else { raw.actor.id };
    let time_nano = if raw.time_nano != 0 {
        raw.time_nano
    } else {
        raw.time.saturating_mul(1_000_000_000)
    };
    Ok(RuntimeEvent {
        kind: raw.kind,
        // health checks report e.g. "exec_start: sh -c ..."
        action: raw
            .action
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string(),
        actor_name: raw.actor.attributes.get("name").cloned().unwrap_or_default(),
        actor_id,
        time_nano,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect() {
        let json = r#"[{
            "Id": "abc123",
            "Name": "/helper",
            "Config": {"Labels": {"dockpanel.session": "s1"}},
            "State": {"Running": true},
            "Mounts": [{"Type": "volume", "Name": "data", "Source": "/var/lib/docker/volumes/data/_data", "Destination": "/srv"}],
            "NetworkSettings": {
                "IPAddress": "172.17.0.2",
                "Ports": {"80/tcp": [{"HostIp": "127.0.0.1", "HostPort": "49153"}], "443/tcp": null},
                "Networks": {"bridge": {"IPAddress": "172.17.0.2"}}
            }
        }]"#;
        let containers = parse_inspect(json).unwrap();
        assert_eq!(containers.len(), 1);
        let c = &containers[0];
        assert_eq!(c.name, "helper");
        assert!(c.running);
        assert_eq!(c.label("dockpanel.session"), Some("s1"));
        assert_eq!(c.mounts[0].name, "data");
        assert_eq!(
            c.ports,
            vec![PublishedPort {
                host_ip: "127.0.0.1".to_string(),
                host_port: 49153,
                container_port: 80,
                protocol: "tcp".to_string(),
            }]
        );
        assert_eq!(c.network_ips, vec!["172.17.0.2".to_string()]);
    }

    #[test]
    fn test_parse_event() {
        let line = r#"{"status":"start","id":"abc","from":"nginx","Type":"container","Action":"start","Actor":{"ID":"abc","Attributes":{"name":"web"}},"scope":"local","time":1700000000,"timeNano":1700000000123456789}"#;
        let event = parse_event(line).unwrap();
        assert_eq!(event.kind, "container");
        assert_eq!(event.action, "start");
        assert_eq!(event.actor_id, "abc");
        assert_eq!(event.actor_name, "web");
        assert_eq!(event.time_nano, 1700000000123456789);
    }
}
