//! Port Allocation Engine
//!
//! Live usage is derived on every request from the OS socket table and the
//! runtime's published ports. Reservations, notes and the scan window live in
//! the [`PortLedger`](crate::storage::ledger::PortLedger).

pub mod allocate;
pub mod engine;
pub mod query;
pub mod usage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use engine::PortEngine;

/// Name of the runtime's userspace port forwarder
pub const PORT_PROXY_PROCESS: &str = "docker-proxy";

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Wire name used in records and notes
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" | "tcp6" => Ok(Protocol::Tcp),
            "udp" | "udp6" => Ok(Protocol::Udp),
            _ => Err(format!("Invalid protocol: {}", s)),
        }
    }
}

/// Who holds a used port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Host,
    Container,
}

impl PortType {
    pub fn as_str(self) -> &'static str {
        match self {
            PortType::Host => "Host",
            PortType::Container => "Container",
        }
    }
}

impl std::str::FromStr for PortType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "host" => Ok(PortType::Host),
            "container" => Ok(PortType::Container),
            _ => Err(format!("Invalid port type: {}", s)),
        }
    }
}

/// Usage of one port for one protocol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortUsage {
    pub used: bool,
    /// `None` for unused ports
    pub port_type: Option<PortType>,
    pub service: String,
}

/// A persisted reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortReservation {
    pub port: u16,
    pub reserved_by: String,
    pub protocol: String,
    #[serde(rename = "type")]
    pub port_type: String,
    pub reserved_at: DateTime<Utc>,
}
