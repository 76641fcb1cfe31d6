//! Typed records for a scanner XML report.
//!
//! Every record derives `Serialize`/`Deserialize` so sessions can be written
//! to and restored from JSON without a second set of types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanner: String,
    pub args: Option<String>,
    pub version: Option<String>,
    pub xml_version: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scan_info: Vec<ScanInfo>,
    pub hosts: Vec<Host>,
    pub stats: RunStats,
}

impl ScanReport {
    /// Look up a host by any of its addresses
    pub fn host(&self, addr: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.addresses.iter().any(|a| a.addr == addr))
    }

    pub fn hosts_up(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(|h| h.is_up())
    }

    pub fn open_port_count(&self) -> usize {
        self.hosts.iter().map(|h| h.open_ports().count()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    pub scan_type: String,
    pub protocol: Protocol,
    pub num_services: Option<u32>,
    pub services: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed: Option<f64>,
    pub summary: Option<String>,
    pub exit: String,
    pub hosts_up: u32,
    pub hosts_down: u32,
    pub hosts_total: u32,
}

impl RunStats {
    pub const INCOMPLETE: &'static str = "incomplete";

    pub fn is_complete(&self) -> bool {
        self.exit != Self::INCOMPLETE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub status: HostStatus,
    pub addresses: Vec<Address>,
    pub hostnames: Vec<Hostname>,
    pub ports: Vec<Port>,
    pub extra_ports: Vec<ExtraPorts>,
    pub os: Vec<OsMatch>,
    pub os_ports_used: Vec<u16>,
    pub uptime: Option<Uptime>,
    pub distance: Option<u32>,
    pub trace: Vec<TraceHop>,
    pub scripts: Vec<Script>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Host {
    /// IPv4 preferred, then IPv6, then MAC
    pub fn primary_address(&self) -> Option<&Address> {
        [AddressType::Ipv4, AddressType::Ipv6, AddressType::Mac]
            .iter()
            .find_map(|kind| self.addresses.iter().find(|a| &a.addr_type == kind))
            .or_else(|| self.addresses.first())
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.addresses.iter()
            .filter(|a| matches!(a.addr_type, AddressType::Ipv4 | AddressType::Ipv6))
            .find_map(|a| a.addr.parse().ok())
    }

    pub fn mac(&self) -> Option<&Address> {
        self.addresses.iter().find(|a| a.addr_type == AddressType::Mac)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostnames.first().map(|h| h.name.as_str())
    }

    pub fn is_up(&self) -> bool {
        self.status.state == HostState::Up
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| p.state == PortStatus::Open)
    }

    pub fn port(&self, protocol: &Protocol, number: u16) -> Option<&Port> {
        self.ports.iter().find(|p| &p.protocol == protocol && p.number == number)
    }

    /// Most accurate OS guess
    pub fn best_os(&self) -> Option<&OsMatch> {
        self.os.iter().max_by_key(|m| m.accuracy)
    }

    /// Key used to merge the same host across several reports
    pub fn key(&self) -> String {
        self.primary_address()
            .map(|a| a.addr.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    pub state: HostState,
    pub reason: Option<String>,
    pub reason_ttl: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Up,
    Down,
    #[default]
    Unknown,
    Skipped,
    Other(String),
}

impl HostState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Unknown => "unknown",
            Self::Skipped => "skipped",
            Self::Other(other) => other,
        }
    }

    /// A missing state is `Unknown`; states this crate does not know are kept verbatim
    pub fn parse(value: &str) -> Self {
        match value {
            "up" => Self::Up,
            "down" => Self::Down,
            "skipped" => Self::Skipped,
            "" | "unknown" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub addr: String,
    pub addr_type: AddressType,
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Ipv4,
    Ipv6,
    Mac,
    Other(String),
}

impl AddressType {
    pub fn parse(value: &str) -> Self {
        match value {
            "ipv4" => Self::Ipv4,
            "ipv6" => Self::Ipv6,
            "mac" => Self::Mac,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hostname {
    pub name: String,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub protocol: Protocol,
    pub number: u16,
    pub state: PortStatus,
    pub reason: Option<String>,
    pub reason_ttl: Option<u8>,
    pub service: Option<Service>,
    pub scripts: Vec<Script>,
}

/// Summary of ports not listed individually, e.g. "995 closed"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraPorts {
    pub state: PortStatus,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    Ip,
    Other(String),
}

impl Protocol {
    pub fn parse(value: &str) -> Self {
        match value {
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "sctp" => Self::Sctp,
            "ip" => Self::Ip,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
            Self::Ip => "ip",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Open,
    Closed,
    Filtered,
    Unfiltered,
    OpenFiltered,
    ClosedFiltered,
    Other(String),
}

impl PortStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "open" => Self::Open,
            "closed" => Self::Closed,
            "filtered" => Self::Filtered,
            "unfiltered" => Self::Unfiltered,
            "open|filtered" => Self::OpenFiltered,
            "closed|filtered" => Self::ClosedFiltered,
            other => Self::Other(other.to_string()),
        }
    }

    /// The spelling the scanner itself uses
    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Filtered => "filtered",
            Self::Unfiltered => "unfiltered",
            Self::OpenFiltered => "open|filtered",
            Self::ClosedFiltered => "closed|filtered",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub product: Option<String>,
    pub version: Option<String>,
    pub extra_info: Option<String>,
    pub os_type: Option<String>,
    pub device_type: Option<String>,
    pub hostname: Option<String>,
    pub method: Option<String>,
    pub confidence: Option<u8>,
    pub tunnel: Option<String>,
    pub cpes: Vec<String>,
}

impl Service {
    /// "product version (extra)" as far as the fields are known
    pub fn banner(&self) -> String {
        let parts: Vec<String> = [
            self.product.clone(),
            self.version.clone(),
            self.extra_info.as_ref().map(|e| format!("({})", e)),
        ]
        .into_iter()
        .flatten()
        .collect();
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub output: String,
    /// Structured `<elem>` values keyed by their dotted table path
    pub elements: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsMatch {
    pub name: String,
    pub accuracy: u8,
    pub classes: Vec<OsClass>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsClass {
    pub vendor: Option<String>,
    pub family: Option<String>,
    pub generation: Option<String>,
    pub device_type: Option<String>,
    pub accuracy: Option<u8>,
    pub cpes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uptime {
    pub seconds: u64,
    pub last_boot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHop {
    pub ttl: u32,
    pub addr: Option<String>,
    pub host: Option<String>,
    pub rtt_ms: Option<f64>,
}
