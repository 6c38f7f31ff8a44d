//! Probe executor.
//!
//! Every probe is a fresh tool invocation with no state shared between calls,
//! wrapped in a hard timeout owned by this module. Expected failures (timeout,
//! unreachable host, broken output, missing tool) come back as a failed
//! [`ProbeResult`], never as an error.

use std::io::ErrorKind;
use std::net::Ipv6Addr;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::nmap;
use crate::ports;
use crate::types::{PortInfo, ProbeFailure, ProbeResult, ScanTemplate, ScanType};

/// Full discovery/fingerprint probe against one address.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: &str, template: &ScanTemplate, timeout: Duration) -> ProbeResult;
}

/// One-shot presence check used by LAN auto-discovery.
#[async_trait]
pub trait AliveCheck: Send + Sync {
    async fn check(&self, ip: &str, timeout: Duration) -> ProbeResult;
}

#[derive(Debug)]
pub enum ToolRun {
    Finished(Output),
    TimedOut,
}

/// Run `program` to completion or until `timeout`, killing it on expiry.
pub async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<ToolRun> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                EngineError::ToolUnavailable(format!("{program}: {e}"))
            }
            _ => EngineError::Io(e),
        })?;

    // dropping the future drops the child, and kill_on_drop reaps it
    match time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(ToolRun::Finished(output?)),
        Err(_) => Ok(ToolRun::TimedOut),
    }
}

/// nmap-backed [`Prober`].
#[derive(Debug, Clone)]
pub struct NmapProber {
    program: String,
    snmp_community: String,
}

impl Default for NmapProber {
    fn default() -> Self {
        Self::new("nmap")
    }
}

impl NmapProber {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            snmp_community: "public".into(),
        }
    }

    pub fn with_snmp_community(mut self, community: impl Into<String>) -> Self {
        self.snmp_community = community.into();
        self
    }

    pub fn build_args(&self, ip: &str, template: &ScanTemplate, timeout: Duration) -> Vec<String> {
        // leave nmap room to flush a partial report before the hard kill
        let host_timeout = (timeout.as_millis() * 9 / 10).max(1);
        let mut args: Vec<String> = vec![
            "-oX".into(),
            "-".into(),
            "--reason".into(),
            "--host-timeout".into(),
            format!("{host_timeout}ms"),
        ];
        if ip.parse::<Ipv6Addr>().is_ok() {
            args.push("-6".into());
        }

        match template.scan_type {
            ScanType::Quick => {
                args.extend(["-sn", "-PE", "-PA21,22,80,443,3389"].map(String::from));
            }
            ScanType::Comprehensive => {
                let port_list = match template.ports.as_deref().map(ports::parse_ports_str) {
                    Some(Ok(list)) if !list.is_empty() => list,
                    Some(Err(e)) => {
                        warn!(error = %e, "bad template port list, using defaults");
                        ports::default_ports()
                    }
                    _ => ports::default_ports(),
                };
                args.extend(["-sV", "-O", "--osscan-guess", "-p"].map(String::from));
                args.push(ports::to_port_arg(&port_list));
            }
            ScanType::Snmp => {
                let community = template
                    .snmp_community
                    .as_deref()
                    .unwrap_or(&self.snmp_community);
                args.extend(
                    ["-sU", "-p", "161", "--script", "snmp-info,snmp-sysdescr", "--script-args"]
                        .map(String::from),
                );
                args.push(format!("snmpcommunity={community}"));
            }
            ScanType::Arp => {
                args.extend(["-sn", "-PR"].map(String::from));
            }
        }

        args.extend(template.extra_args.iter().cloned());
        args.push(ip.to_string());
        args
    }
}

#[async_trait]
impl Prober for NmapProber {
    async fn probe(&self, ip: &str, template: &ScanTemplate, timeout: Duration) -> ProbeResult {
        let args = self.build_args(ip, template, timeout);
        debug!(ip, scan_type = %template.scan_type, "probing");

        let output = match run_tool(&self.program, &args, timeout).await {
            Ok(ToolRun::Finished(output)) => output,
            Ok(ToolRun::TimedOut) => return ProbeResult::timeout(ip),
            Err(EngineError::ToolUnavailable(msg)) => {
                return ProbeResult::failed(ip, ProbeFailure::ToolUnavailable, msg)
            }
            Err(e) => return ProbeResult::failed(ip, ProbeFailure::ToolError, e.to_string()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let failure = if stderr.contains("requires root privileges") {
                ProbeFailure::ToolUnavailable
            } else {
                ProbeFailure::ToolError
            };
            let msg = format!("{} exited with {}: {stderr}", self.program, output.status);
            return ProbeResult::failed(ip, failure, msg);
        }

        match nmap::parse_report(ip, &stdout) {
            Ok(result) => result,
            Err(e) => ProbeResult::failed(ip, ProbeFailure::MalformedOutput, e.to_string()),
        }
    }
}

/// TCP connect sweep over a handful of common ports. A handshake or an
/// explicit refusal both prove something is there.
#[derive(Debug, Clone)]
pub struct TcpAliveCheck {
    ports: Vec<u16>,
}

impl Default for TcpAliveCheck {
    fn default() -> Self {
        Self::new(vec![22, 80, 135, 139, 443, 445, 3389])
    }
}

impl TcpAliveCheck {
    pub fn new(ports: Vec<u16>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl AliveCheck for TcpAliveCheck {
    async fn check(&self, ip: &str, timeout: Duration) -> ProbeResult {
        let mut set = JoinSet::new();
        for &port in &self.ports {
            let host = ip.to_string();
            set.spawn(async move {
                let start = Instant::now();
                let res = time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await;
                (port, start.elapsed(), res)
            });
        }

        let mut result = ProbeResult::completed(ip);
        while let Some(joined) = set.join_next().await {
            let Ok((port, elapsed, res)) = joined else {
                continue;
            };
            let answered = match res {
                Ok(Ok(_stream)) => {
                    result.ports.push(PortInfo::open(port, "tcp"));
                    true
                }
                Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
                Err(_) => false,
            };
            if answered {
                result.host_up = true;
                let ms = elapsed.as_secs_f64() * 1000.0;
                result.response_time = Some(result.response_time.map_or(ms, |prev| prev.min(ms)));
            }
        }
        result.ports.sort_by_key(|p| p.port);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn quick_args_are_ping_only() {
        let args = NmapProber::default().build_args(
            "10.0.0.1",
            &ScanTemplate::new(ScanType::Quick),
            Duration::from_secs(10),
        );
        assert_eq!(args[..5], ["-oX", "-", "--reason", "--host-timeout", "9000ms"]);
        assert!(args.contains(&"-sn".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn ipv6_targets_switch_nmap_to_v6() {
        let prober = NmapProber::default();
        let quick = ScanTemplate::new(ScanType::Quick);
        let v6 = prober.build_args("fd00::1", &quick, Duration::from_secs(5));
        assert_eq!(v6[5], "-6");
        assert_eq!(v6.last().map(String::as_str), Some("fd00::1"));

        let v4 = prober.build_args("10.0.0.1", &quick, Duration::from_secs(5));
        assert!(!v4.contains(&"-6".to_string()));
        let name = prober.build_args("printer.lan", &quick, Duration::from_secs(5));
        assert!(!name.contains(&"-6".to_string()));
    }

    #[test]
    fn comprehensive_uses_template_ports() {
        let template = ScanTemplate::new(ScanType::Comprehensive).with_ports("443, 22,80");
        let args = NmapProber::default().build_args("h", &template, Duration::from_secs(60));
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "22,80,443");
        assert!(args.contains(&"-O".to_string()) && args.contains(&"-sV".to_string()));
    }

    #[test]
    fn snmp_community_prefers_template() {
        let prober = NmapProber::default().with_snmp_community("site");
        let mut template = ScanTemplate::new(ScanType::Snmp);
        let args = prober.build_args("h", &template, Duration::from_secs(5));
        assert!(args.contains(&"snmpcommunity=site".to_string()));

        template.snmp_community = Some("private".into());
        let args = prober.build_args("h", &template, Duration::from_secs(5));
        assert!(args.contains(&"snmpcommunity=private".to_string()));
    }

    #[tokio::test]
    async fn missing_tool_is_a_failed_result() {
        let prober = NmapProber::new("/nonexistent/bin/nmap");
        let r = prober
            .probe("10.0.0.1", &ScanTemplate::default(), Duration::from_secs(1))
            .await;
        assert!(r.is_failed());
        assert_eq!(r.failure, Some(ProbeFailure::ToolUnavailable));
        assert!(r.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_is_cut_off() {
        let start = Instant::now();
        let run = run_tool("sleep", &["5".to_string()], Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(run, ToolRun::TimedOut));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn alive_check_sees_listener_and_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let r = TcpAliveCheck::new(vec![open, closed])
            .check("127.0.0.1", Duration::from_millis(500))
            .await;
        assert!(r.host_up);
        assert!(r.response_time.is_some());
        assert_eq!(r.ports, vec![PortInfo::open(open, "tcp")]);

        let r = TcpAliveCheck::new(vec![closed])
            .check("127.0.0.1", Duration::from_millis(500))
            .await;
        assert!(r.host_up, "refused connection still proves presence");
        assert!(r.ports.is_empty());
    }
}
