use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::ScanType;

/// Engine tunables. Every field has a default so a partial JSON file is fine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub nmap_path: String,
    pub timeouts: Timeouts,
    pub storage_retries: u32,
    pub retry_backoff_ms: u64,
    pub lan_depth: u8,
    pub lan_max_candidates: usize,
    /// Local address `auto` samples around; detected when unset.
    pub lan_anchor: Option<Ipv4Addr>,
    pub max_targets: u64,
    pub snmp_community: String,
}

/// Per-host timeouts in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    pub quick_ms: u64,
    pub comprehensive_ms: u64,
    pub snmp_ms: u64,
    pub arp_ms: u64,
    pub alive_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            quick_ms: 10_000,
            comprehensive_ms: 300_000,
            snmp_ms: 30_000,
            arp_ms: 10_000,
            alive_ms: 1_000,
        }
    }
}

impl Timeouts {
    pub fn for_scan_type(&self, scan_type: ScanType) -> Duration {
        let ms = match scan_type {
            ScanType::Quick => self.quick_ms,
            ScanType::Comprehensive => self.comprehensive_ms,
            ScanType::Snmp => self.snmp_ms,
            ScanType::Arp => self.arp_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn alive(&self) -> Duration {
        Duration::from_millis(self.alive_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            nmap_path: "nmap".into(),
            timeouts: Timeouts::default(),
            storage_retries: 3,
            retry_backoff_ms: 50,
            lan_depth: 1,
            lan_max_candidates: 100,
            lan_anchor: None,
            max_targets: 65_536,
            snmp_community: "public".into(),
        }
    }
}

impl EngineConfig {
    pub const MAX_CONCURRENCY: usize = 256;

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig = serde_json::from_str(s).context("invalid engine config")?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_json_str(&content)
    }

    /// Requested concurrency clamped to what the engine will actually run.
    pub fn effective_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_concurrency)
            .clamp(1, Self::MAX_CONCURRENCY)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
