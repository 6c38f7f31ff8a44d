use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scan_engine::config::EngineConfig;
use scan_engine::{netdetect, ports, server};
use scan_engine::{Discovery, ScanEngine, ScanRequest, ScanTemplate, ScanType, TaskStatus};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "scan-engine",
    version,
    about = "Bounded-concurrency network discovery with nmap-backed fingerprinting.",
    long_about = None
)]
struct Cli {
    /// CIDR, range (10.0.0.5-20), comma list, single host, or `auto` to sample the local LAN.
    #[arg(long, default_value = "auto")]
    target: String,

    /// quick | comprehensive | snmp | arp
    #[arg(long = "scan-type", default_value = "quick")]
    scan_type: ScanType,

    /// Max probes in flight (defaults to the config value).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-host timeout in milliseconds (defaults per scan type).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Port list for comprehensive scans, e.g. `22,80,8000-8010`.
    #[arg(long, conflicts_with = "ports_file")]
    ports: Option<String>,

    /// Path to a ports list file (one port or range per line).
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// JSON engine config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the nmap binary.
    #[arg(long)]
    nmap: Option<String>,

    /// Write discoveries as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the scan API over HTTP instead of running a single scan.
    #[arg(long, default_value_t = false)]
    serve: bool,

    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scan_engine=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(c) = cli.concurrency {
        config.max_concurrency = c;
    }
    if let Some(nmap) = cli.nmap.clone() {
        config.nmap_path = nmap;
    }

    let engine = Arc::new(ScanEngine::with_nmap(config));

    if cli.serve {
        return server::spawn_server(&cli.bind, engine).await;
    }

    if cli.target.trim().eq_ignore_ascii_case("auto") {
        match netdetect::primary_ipv4() {
            Ok(ip) => info!(local = %ip, "sampling local network"),
            Err(e) => warn!(error = %e, "failed to detect local network"),
        }
    }

    let mut template = ScanTemplate::new(cli.scan_type);
    template.timeout = cli.timeout_ms.map(Duration::from_millis);
    template.ports = match (&cli.ports, &cli.ports_file) {
        (Some(list), _) => Some(list.clone()),
        (None, Some(path)) => Some(ports::to_port_arg(&ports::load_ports_from_path(path)?)),
        (None, None) => None,
    };

    let task_id = engine
        .start_scan_with(ScanRequest {
            target: cli.target.clone(),
            template,
            max_concurrency: None,
        })
        .await?;

    // Ctrl-C cancels the scan; results gathered so far are kept.
    let cancel_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = cancel_engine.request_cancel(task_id).await {
                warn!(task_id = %task_id, error = %e, "failed to request cancellation");
            }
        }
    });

    let ticker_engine = engine.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            interval.tick().await;
            if let Ok(p) = ticker_engine.get_progress(task_id).await {
                info!(
                    progress = p.progress,
                    completed = p.completed_ips,
                    total = p.total_ips,
                    current = p.current_ip.as_deref().unwrap_or("-"),
                    "scanning"
                );
            }
        }
    });

    let status = engine.wait(task_id).await?;
    ticker.abort();

    let report = engine.get_progress(task_id).await?;
    let discoveries = engine.discoveries(task_id).await?;
    print_results_table(&discoveries);
    println!(
        "\nTask {} {}: {}/{} addresses probed, {} devices",
        task_id, status, report.completed_ips, report.total_ips, report.discovered_devices
    );
    if status == TaskStatus::Failed {
        eprintln!(
            "error: {}",
            report.error_message.as_deref().unwrap_or("unknown failure")
        );
    }

    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_results_json(path, &discoveries) {
            eprintln!("Failed to write JSON to {}: {:#}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }

    Ok(())
}

fn print_results_table(discoveries: &[Discovery]) {
    let rows: Vec<[String; 5]> = discoveries
        .iter()
        .map(|d| {
            let open: Vec<String> = d
                .ports
                .iter()
                .filter(|p| p.is_open())
                .map(|p| format!("{}/{}", p.port, p.protocol))
                .collect();
            [
                d.ip.clone(),
                d.hostname.clone().unwrap_or_default(),
                d.mac_address.clone().unwrap_or_default(),
                d.os_name.clone().or_else(|| d.vendor.clone()).unwrap_or_default(),
                open.join(","),
            ]
        })
        .collect();

    let headers = ["ip", "hostname", "mac", "os/vendor", "open"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len().min(40));
        }
    }

    println!("\nDiscovered devices: {}", rows.len());
    let line = |cells: [&str; 5]| {
        let parts: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(c, w)| {
                let c: String = c.chars().take(40).collect();
                format!("{c:<w$}")
            })
            .collect();
        println!("{}", parts.join("  ").trim_end());
    };
    line(headers);
    line(widths.map(|_| "--"));
    for row in &rows {
        line(row.each_ref().map(String::as_str));
    }
}

fn write_results_json(path: &std::path::Path, discoveries: &[Discovery]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, discoveries)?;
    Ok(())
}
