//! Live port usage from the OS socket table and the container runtime

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::PanelError;
use crate::ports::{PortType, PortUsage, Protocol, PORT_PROXY_PROCESS};
use crate::runtime::ContainerInfo;

const PORT_SPACE: usize = u16::MAX as usize + 1;

/// A listening socket as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningSocket {
    pub protocol: Protocol,
    pub port: u16,
    /// Owning process name, empty when unknown
    pub process: String,
}

/// Source of the OS socket table
#[async_trait]
pub trait SocketTable: Send + Sync {
    async fn listening_sockets(&self) -> Result<Vec<ListeningSocket>, PanelError>;
}

/// Reads the socket table with `netstat -tulnp`, falling back to `ss -tulnpH`
pub struct NetstatTable {
    timeout: Duration,
}

impl NetstatTable {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, PanelError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| PanelError::RuntimeTimeout(program.to_string()))??;
        if !output.status.success() && output.stdout.is_empty() {
            return Err(PanelError::RuntimeError(format!(
                "{} exited with {}",
                program, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for NetstatTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl SocketTable for NetstatTable {
    async fn listening_sockets(&self) -> Result<Vec<ListeningSocket>, PanelError> {
        match self.run("netstat", &["-tulnp"]).await {
            Ok(out) => Ok(parse_netstat(&out)),
            Err(e) => {
                debug!("netstat unavailable ({}), trying ss", e);
                let out = self.run("ss", &["-tulnpH"]).await?;
                Ok(parse_ss(&out))
            }
        }
    }
}

fn port_of(address: &str) -> Option<u16> {
    address.rsplit_once(':')?.1.parse().ok()
}

/// Parse `netstat -tulnp` output
pub fn parse_netstat(output: &str) -> Vec<ListeningSocket> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let protocol: Protocol = fields[0].parse().ok()?;
            let port = port_of(fields[3])?;
            // udp rows have no State column
            let process = fields
                .iter()
                .skip(5)
                .find(|f| f.contains('/') || **f == "-")
                .and_then(|f| f.split_once('/'))
                .map(|(_, name)| name.trim_end_matches(':').to_string())
                .unwrap_or_default();
            Some(ListeningSocket {
                protocol,
                port,
                process,
            })
        })
        .collect()
}

/// Parse `ss -tulnpH` output
pub fn parse_ss(output: &str) -> Vec<ListeningSocket> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            let protocol: Protocol = fields[0].parse().ok()?;
            let port = port_of(fields[4])?;
            // users:(("sshd",pid=1,fd=3))
            let process = line
                .split_once("((\"")
                .and_then(|(_, rest)| rest.split_once('"'))
                .map(|(name, _)| name.to_string())
                .unwrap_or_default();
            Some(ListeningSocket {
                protocol,
                port,
                process,
            })
        })
        .collect()
}

/// Usage of the whole port space for both protocols
#[derive(Debug, Clone)]
pub struct UsageTable {
    tcp: Vec<PortUsage>,
    udp: Vec<PortUsage>,
}

impl UsageTable {
    pub fn empty() -> Self {
        Self {
            tcp: vec![PortUsage::default(); PORT_SPACE],
            udp: vec![PortUsage::default(); PORT_SPACE],
        }
    }

    pub fn get(&self, protocol: Protocol, port: u16) -> &PortUsage {
        match protocol {
            Protocol::Tcp => &self.tcp[port as usize],
            Protocol::Udp => &self.udp[port as usize],
        }
    }

    fn get_mut(&mut self, protocol: Protocol, port: u16) -> &mut PortUsage {
        match protocol {
            Protocol::Tcp => &mut self.tcp[port as usize],
            Protocol::Udp => &mut self.udp[port as usize],
        }
    }

    /// Merge the OS view with runtime-published ports.
    ///
    /// Runtime attribution wins over whatever the OS reported for the port.
    pub fn build(sockets: &[ListeningSocket], containers: &[ContainerInfo]) -> Self {
        let mut table = Self::empty();

        for socket in sockets {
            let usage = table.get_mut(socket.protocol, socket.port);
            usage.used = true;
            if socket.process == PORT_PROXY_PROCESS {
                usage.port_type = Some(PortType::Container);
            } else if usage.port_type.is_none() {
                usage.port_type = Some(PortType::Host);
            }
            if usage.service.is_empty() {
                usage.service = socket.process.clone();
            }
        }

        for container in containers {
            for published in &container.ports {
                let Ok(protocol) = published.protocol.parse::<Protocol>() else {
                    continue;
                };
                let usage = table.get_mut(protocol, published.host_port);
                usage.used = true;
                usage.port_type = Some(PortType::Container);
                usage.service = container.name.clone();
            }
        }

        table
    }
}

/// Gather live usage; a failing source degrades to an empty view of that source
pub async fn gather_usage(
    sockets: &dyn SocketTable,
    runtime: &dyn crate::runtime::ContainerRuntime,
) -> UsageTable {
    let os = match sockets.listening_sockets().await {
        Ok(os) => os,
        Err(e) => {
            warn!("Unable to read OS socket table: {}", e);
            Vec::new()
        }
    };
    let containers = match runtime.list_containers(false, None).await {
        Ok(containers) => containers,
        Err(e) => {
            warn!("Unable to list container ports: {}", e);
            Vec::new()
        }
    };
    UsageTable::build(&os, &containers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PublishedPort;

    const NETSTAT: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN      812/sshd: /usr/sbin
tcp        0      0 0.0.0.0:8080            0.0.0.0:*               LISTEN      1502/docker-proxy
tcp6       0      0 :::5432                 :::*                    LISTEN      -
udp        0      0 0.0.0.0:68              0.0.0.0:*                           640/dhclient
";

    #[test]
    fn test_parse_netstat() {
        let sockets = parse_netstat(NETSTAT);
        assert_eq!(sockets.len(), 4);
        assert_eq!(sockets[0].port, 22);
        assert_eq!(sockets[0].process, "sshd");
        assert_eq!(sockets[1].process, "docker-proxy");
        assert_eq!(sockets[2].process, "");
        assert_eq!(sockets[2].port, 5432);
        assert_eq!(sockets[3].protocol, Protocol::Udp);
        assert_eq!(sockets[3].process, "dhclient");
    }

    #[test]
    fn test_parse_ss() {
        let out = "tcp   LISTEN 0      4096   0.0.0.0:22   0.0.0.0:*   users:((\"sshd\",pid=1,fd=3))\n\
                   udp   UNCONN 0      0      [::]:5353    [::]:*\n";
        let sockets = parse_ss(out);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].process, "sshd");
        assert_eq!(sockets[1].port, 5353);
        assert_eq!(sockets[1].process, "");
    }

    #[test]
    fn test_classification() {
        let sockets = parse_netstat(NETSTAT);
        let containers = vec![ContainerInfo {
            name: "db".to_string(),
            ports: vec![PublishedPort {
                host_ip: "0.0.0.0".to_string(),
                host_port: 5432,
                container_port: 5432,
                protocol: "tcp".to_string(),
            }],
            ..Default::default()
        }];
        let table = UsageTable::build(&sockets, &containers);

        let ssh = table.get(Protocol::Tcp, 22);
        assert_eq!(ssh.port_type, Some(PortType::Host));

        let proxied = table.get(Protocol::Tcp, 8080);
        assert_eq!(proxied.port_type, Some(PortType::Container));

        let db = table.get(Protocol::Tcp, 5432);
        assert_eq!(db.port_type, Some(PortType::Container));
        assert_eq!(db.service, "db");

        let free = table.get(Protocol::Tcp, 9999);
        assert!(!free.used);
        assert_eq!(free.port_type, None);
        assert!(!table.get(Protocol::Udp, 22).used);
    }
}
