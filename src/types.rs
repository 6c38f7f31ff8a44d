use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::task::{TaskId, TaskStatus};

/// Probe configuration family. Selects the scan tool arguments and default timeout.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    #[default]
    Quick,
    Comprehensive,
    Snmp,
    Arp,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Quick => "quick",
            ScanType::Comprehensive => "comprehensive",
            ScanType::Snmp => "snmp",
            ScanType::Arp => "arp",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(ScanType::Quick),
            "comprehensive" | "full" => Ok(ScanType::Comprehensive),
            "snmp" => Ok(ScanType::Snmp),
            "arp" => Ok(ScanType::Arp),
            other => Err(format!("unknown scan type: {other}")),
        }
    }
}

/// Resolved probe parameters for one scan task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanTemplate {
    pub scan_type: ScanType,
    /// Per-host timeout; falls back to the configured default for `scan_type`.
    #[serde(default, with = "duration_ms")]
    pub timeout: Option<Duration>,
    /// Port list in the `ports` module grammar, e.g. `22,80,8000-8010`.
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub snmp_community: Option<String>,
}

impl ScanTemplate {
    pub fn new(scan_type: ScanType) -> Self {
        Self {
            scan_type,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ports(mut self, ports: impl Into<String>) -> Self {
        self.ports = Some(ports.into());
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// One port line from a probe report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port: u16,
    pub protocol: String,
    pub service: Option<String>,
    pub state: String,
    pub version: Option<String>,
}

impl PortInfo {
    pub fn open(port: u16, protocol: impl Into<String>) -> Self {
        Self {
            port,
            protocol: protocol.into(),
            service: None,
            state: "open".into(),
            version: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == "open"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Completed,
    Failed,
}

/// Why a probe failed. `ToolUnavailable` is environment-wide, the rest are per host.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailure {
    Timeout,
    ToolUnavailable,
    ToolError,
    MalformedOutput,
}

/// Raw outcome of one probe against one address. Transient: distilled into a
/// [`Discovery`] when classified as a device, dropped otherwise.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub ip: String,
    pub status: ProbeStatus,
    /// The tool reported the host as up.
    pub host_up: bool,
    /// The tool gave up on the host before finishing every phase.
    pub partial: bool,
    pub raw_output: String,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    pub os_name: Option<String>,
    pub os_family: Option<String>,
    /// Round-trip time in milliseconds.
    pub response_time: Option<f64>,
    pub ttl: Option<u8>,
    pub ports: Vec<PortInfo>,
    pub services: Vec<String>,
    pub failure: Option<ProbeFailure>,
    pub error: Option<String>,
}

impl ProbeResult {
    /// A completed probe that saw nothing yet; parsers fill the fields in.
    pub fn completed(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            status: ProbeStatus::Completed,
            host_up: false,
            partial: false,
            raw_output: String::new(),
            hostname: None,
            mac_address: None,
            vendor: None,
            os_name: None,
            os_family: None,
            response_time: None,
            ttl: None,
            ports: Vec::new(),
            services: Vec::new(),
            failure: None,
            error: None,
        }
    }

    pub fn failed(ip: impl Into<String>, failure: ProbeFailure, error: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Failed,
            failure: Some(failure),
            error: Some(error.into()),
            ..Self::completed(ip)
        }
    }

    pub fn timeout(ip: impl Into<String>) -> Self {
        Self::failed(ip, ProbeFailure::Timeout, "timeout")
    }

    pub fn is_failed(&self) -> bool {
        self.status == ProbeStatus::Failed
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &PortInfo> {
        self.ports.iter().filter(|p| p.is_open())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Completed,
    Failed,
    Partial,
}

/// One host classified as a device during a scan task. Append-only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Discovery {
    pub scan_task_id: TaskId,
    pub ip: String,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    pub os_name: Option<String>,
    pub os_family: Option<String>,
    pub response_time: Option<f64>,
    pub ttl: Option<u8>,
    pub ports: Vec<PortInfo>,
    pub services: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub scan_status: DiscoveryStatus,
}

impl Discovery {
    pub fn from_probe(task_id: TaskId, result: ProbeResult) -> Self {
        let scan_status = match (result.status, result.partial) {
            (ProbeStatus::Failed, _) => DiscoveryStatus::Failed,
            (ProbeStatus::Completed, true) => DiscoveryStatus::Partial,
            (ProbeStatus::Completed, false) => DiscoveryStatus::Completed,
        };
        Self {
            scan_task_id: task_id,
            ip: result.ip,
            hostname: result.hostname,
            mac_address: result.mac_address,
            vendor: result.vendor,
            os_name: result.os_name,
            os_family: result.os_family,
            response_time: result.response_time,
            ttl: result.ttl,
            ports: result.ports,
            services: result.services,
            timestamp: OffsetDateTime::now_utc(),
            scan_status,
        }
    }
}

/// What a poller sees of a running or finished task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub total_ips: u64,
    pub completed_ips: u64,
    pub current_ip: Option<String>,
    pub discovered_devices: u64,
    pub error_message: Option<String>,
}
