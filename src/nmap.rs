//! Partial nmap XML (`-oX`) schema and its mapping onto [`ProbeResult`].
//!
//! Only the elements the classifier and discovery records use are modelled.
//! Everything is optional: a field nmap did not report stays empty.

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::types::{PortInfo, ProbeResult};

#[derive(Debug, Deserialize, Default)]
pub struct NmapRun {
    #[serde(rename = "host", default)]
    pub hosts: Vec<Host>,
}

#[derive(Debug, Deserialize)]
pub struct Host {
    #[serde(rename = "@timedout", default)]
    pub timedout: Option<String>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(rename = "address", default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub hostnames: Option<Hostnames>,
    #[serde(default)]
    pub ports: Option<Ports>,
    #[serde(default)]
    pub os: Option<Os>,
    #[serde(default)]
    pub times: Option<Times>,
    #[serde(default)]
    pub hostscript: Option<HostScript>,
}

#[derive(Debug, Deserialize)]
pub struct Status {
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@reason_ttl", default)]
    pub reason_ttl: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Address {
    #[serde(rename = "@addr")]
    pub addr: String,
    #[serde(rename = "@addrtype")]
    pub addr_type: String,
    #[serde(rename = "@vendor", default)]
    pub vendor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Hostnames {
    #[serde(rename = "hostname", default)]
    pub hostnames: Vec<Hostname>,
}

#[derive(Debug, Deserialize)]
pub struct Hostname {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Ports {
    #[serde(rename = "port", default)]
    pub ports: Vec<Port>,
}

#[derive(Debug, Deserialize)]
pub struct Port {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@portid")]
    pub portid: String,
    pub state: PortState,
    #[serde(default)]
    pub service: Option<Service>,
    #[serde(rename = "script", default)]
    pub scripts: Vec<Script>,
}

#[derive(Debug, Deserialize)]
pub struct PortState {
    #[serde(rename = "@state")]
    pub state: String,
    #[serde(rename = "@reason_ttl", default)]
    pub reason_ttl: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Service {
    #[serde(rename = "@name", default)]
    pub name: Option<String>,
    #[serde(rename = "@product", default)]
    pub product: Option<String>,
    #[serde(rename = "@version", default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Os {
    #[serde(rename = "osmatch", default)]
    pub matches: Vec<OsMatch>,
}

#[derive(Debug, Deserialize)]
pub struct OsMatch {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "osclass", default)]
    pub classes: Vec<OsClass>,
}

#[derive(Debug, Deserialize)]
pub struct OsClass {
    #[serde(rename = "@osfamily", default)]
    pub family: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Times {
    /// Smoothed round-trip time in microseconds.
    #[serde(rename = "@srtt", default)]
    pub srtt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HostScript {
    #[serde(rename = "script", default)]
    pub scripts: Vec<Script>,
}

#[derive(Debug, Deserialize)]
pub struct Script {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@output", default)]
    pub output: Option<String>,
}

impl Host {
    fn has_address(&self, ip: &str) -> bool {
        self.addresses
            .iter()
            .any(|a| a.addr_type != "mac" && a.addr == ip)
    }

    fn scripts(&self) -> impl Iterator<Item = &Script> {
        let port_scripts = self
            .ports
            .iter()
            .flat_map(|p| p.ports.iter())
            .flat_map(|p| p.scripts.iter());
        let host_scripts = self.hostscript.iter().flat_map(|h| h.scripts.iter());
        port_scripts.chain(host_scripts)
    }
}

/// Parse an nmap XML report for `ip` into a completed [`ProbeResult`].
///
/// A report without a `<host>` element means the address never answered.
pub fn parse_report(ip: &str, xml: &str) -> Result<ProbeResult> {
    let run: NmapRun =
        quick_xml::de::from_str(xml).map_err(|e| EngineError::MalformedOutput(e.to_string()))?;

    let mut result = ProbeResult::completed(ip);
    result.raw_output = xml.to_string();

    let Some(host) = run
        .hosts
        .iter()
        .find(|h| h.has_address(ip))
        .or_else(|| run.hosts.first())
    else {
        return Ok(result);
    };
    apply_host(&mut result, host);
    Ok(result)
}

fn apply_host(result: &mut ProbeResult, host: &Host) {
    result.host_up = host.status.as_ref().is_some_and(|s| s.state == "up");
    result.partial = host.timedout.as_deref() == Some("true");

    if let Some(mac) = host.addresses.iter().find(|a| a.addr_type == "mac") {
        result.mac_address = Some(mac.addr.clone());
        result.vendor = non_empty(mac.vendor.as_deref());
    }

    if let Some(names) = &host.hostnames {
        let preferred = names
            .hostnames
            .iter()
            .find(|h| h.kind.as_deref() == Some("PTR"))
            .or_else(|| names.hostnames.first());
        result.hostname = preferred.and_then(|h| non_empty(Some(h.name.as_str())));
    }

    if let Some(best) = host.os.as_ref().and_then(|os| os.matches.first()) {
        result.os_name = non_empty(Some(best.name.as_str()));
        result.os_family = best
            .classes
            .iter()
            .find_map(|c| non_empty(c.family.as_deref()));
    }
    if result.os_name.is_none() {
        result.os_name = host
            .scripts()
            .find(|s| s.id == "snmp-sysdescr")
            .and_then(|s| s.output.as_deref())
            .and_then(|out| non_empty(out.lines().map(str::trim).find(|l| !l.is_empty())));
    }

    result.response_time = host
        .times
        .as_ref()
        .and_then(|t| t.srtt.as_deref())
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|us| *us >= 0.0)
        .map(|us| us / 1000.0);

    let ports: &[Port] = host.ports.as_ref().map(|p| p.ports.as_slice()).unwrap_or(&[]);
    result.ttl = host
        .status
        .as_ref()
        .and_then(|s| parse_ttl(s.reason_ttl.as_deref()))
        .or_else(|| ports.iter().find_map(|p| parse_ttl(p.state.reason_ttl.as_deref())));

    for port in ports {
        let Ok(number) = port.portid.parse::<u16>() else {
            continue;
        };
        let service = port.service.as_ref();
        let version = service.and_then(|s| {
            let parts: Vec<&str> = [s.product.as_deref(), s.version.as_deref()]
                .into_iter()
                .flatten()
                .filter(|p| !p.is_empty())
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        });
        let info = PortInfo {
            port: number,
            protocol: port.protocol.clone(),
            service: service.and_then(|s| non_empty(s.name.as_deref())),
            state: port.state.state.clone(),
            version,
        };
        if info.is_open() {
            if let Some(name) = &info.service {
                if !result.services.contains(name) {
                    result.services.push(name.clone());
                }
            }
        }
        result.ports.push(info);
    }
}

/// Zero means nmap did not see a real reply (localhost, user-set reasons).
fn parse_ttl(v: Option<&str>) -> Option<u8> {
    v.and_then(|s| s.parse::<u8>().ok()).filter(|ttl| *ttl > 0)
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}
