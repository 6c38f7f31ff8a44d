use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use scan_engine::config::EngineConfig;
use scan_engine::error::{EngineError, Result};
use scan_engine::probe::{AliveCheck, Prober};
use scan_engine::store::{MemoryStore, TaskStore};
use scan_engine::task::TerminalUpdate;
use scan_engine::types::{PortInfo, ProbeFailure};
use scan_engine::{
    Discovery, ProbeResult, ScanEngine, ScanTask, ScanTemplate, ScanType, TaskId, TaskStatus,
};

/// Prober whose answer is decided per address by a closure.
struct FnProber<F>(F);

#[async_trait]
impl<F> Prober for FnProber<F>
where
    F: Fn(&str) -> ProbeResult + Send + Sync,
{
    async fn probe(&self, ip: &str, _template: &ScanTemplate, _timeout: Duration) -> ProbeResult {
        tokio::task::yield_now().await;
        (self.0)(ip)
    }
}

struct NobodyHome;

#[async_trait]
impl AliveCheck for NobodyHome {
    async fn check(&self, ip: &str, _timeout: Duration) -> ProbeResult {
        ProbeResult::completed(ip)
    }
}

fn unreachable(ip: &str) -> ProbeResult {
    ProbeResult::failed(ip, ProbeFailure::ToolError, "host unreachable")
}

fn test_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

fn engine_with(store: Arc<dyn TaskStore>, prober: impl Prober + 'static) -> ScanEngine {
    ScanEngine::new(store, Arc::new(prober), Arc::new(NobodyHome), test_config())
}

async fn task(engine: &ScanEngine, id: TaskId) -> ScanTask {
    engine.store().get_task(id).await.unwrap()
}

/// Delegates to a [`MemoryStore`], records every progress write and can be
/// told to fail discovery inserts.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    progress: Mutex<Vec<(u64, u8)>>,
    fail_discoveries: bool,
}

#[async_trait]
impl TaskStore for RecordingStore {
    async fn create_scan_task(&self, target: &str, template: &ScanTemplate) -> Result<TaskId> {
        self.inner.create_scan_task(target, template).await
    }

    async fn get_task(&self, id: TaskId) -> Result<ScanTask> {
        self.inner.get_task(id).await
    }

    async fn start_task(&self, id: TaskId, total_ips: u64) -> Result<()> {
        self.inner.start_task(id, total_ips).await
    }

    async fn update_task_progress(
        &self,
        id: TaskId,
        completed_ips: u64,
        current_ip: &str,
        progress: u8,
    ) -> Result<()> {
        self.inner
            .update_task_progress(id, completed_ips, current_ip, progress)
            .await?;
        self.progress.lock().unwrap().push((completed_ips, progress));
        Ok(())
    }

    async fn set_task_terminal(&self, id: TaskId, update: TerminalUpdate) -> Result<()> {
        self.inner.set_task_terminal(id, update).await
    }

    async fn insert_discovery(&self, discovery: Discovery) -> Result<()> {
        if self.fail_discoveries {
            return Err(EngineError::Storage("disk full".into()));
        }
        self.inner.insert_discovery(discovery).await
    }

    async fn list_discoveries(&self, id: TaskId) -> Result<Vec<Discovery>> {
        self.inner.list_discoveries(id).await
    }

    async fn request_cancel(&self, id: TaskId) -> Result<bool> {
        self.inner.request_cancel(id).await
    }
}

#[tokio::test]
async fn unreachable_hosts_complete_without_discoveries() {
    let engine = engine_with(Arc::new(MemoryStore::new()), FnProber(unreachable));
    let id = engine.start_scan("10.0.0.0/30", ScanType::Quick).await.unwrap();

    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Completed);
    let t = task(&engine, id).await;
    assert_eq!((t.completed_ips, t.total_ips, t.progress), (2, 2, 100));
    assert_eq!(t.discovered_devices, 0);
    assert!(t.end_time.is_some());
    assert!(engine.discoveries(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn only_responsive_hosts_become_discoveries() {
    let prober = FnProber(|ip: &str| {
        let mut r = ProbeResult::completed(ip);
        if ip == "10.0.0.2" {
            r.host_up = true;
            r.ports.push(PortInfo::open(22, "tcp"));
        }
        r
    });
    let engine = engine_with(Arc::new(MemoryStore::new()), prober);
    let id = engine.start_scan("10.0.0.1-4", ScanType::Quick).await.unwrap();

    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Completed);
    let found = engine.discoveries(id).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].ip, "10.0.0.2");
    assert_eq!(found[0].scan_task_id, id);
    assert_eq!(task(&engine, id).await.discovered_devices, 1);
}

struct GaugedProber {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Prober for GaugedProber {
    async fn probe(&self, ip: &str, _template: &ScanTemplate, _timeout: Duration) -> ProbeResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ProbeResult::completed(ip)
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_the_limit() {
    let prober = Arc::new(GaugedProber {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let engine = ScanEngine::new(
        Arc::new(MemoryStore::new()),
        prober.clone(),
        Arc::new(NobodyHome),
        test_config(),
    );
    let mut req = scan_engine::ScanRequest::new("10.0.0.1-12", ScanType::Quick);
    req.max_concurrency = Some(3);
    let id = engine.start_scan_with(req).await.unwrap();

    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Completed);
    let peak = prober.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency was {peak}");
    assert!(peak >= 1);
    assert_eq!(task(&engine, id).await.completed_ips, 12);
}

#[tokio::test]
async fn progress_only_moves_forward() {
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(store.clone(), FnProber(unreachable));
    let mut req = scan_engine::ScanRequest::new("10.0.0.1-30", ScanType::Quick);
    req.max_concurrency = Some(4);
    let id = engine.start_scan_with(req).await.unwrap();
    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Completed);

    let writes = store.progress.lock().unwrap().clone();
    assert_eq!(writes.len(), 30);
    for pair in writes.windows(2) {
        assert!(pair[1].0 > pair[0].0, "completed went backwards: {pair:?}");
        assert!(pair[1].1 >= pair[0].1, "progress went backwards: {pair:?}");
    }
    assert_eq!(writes.last(), Some(&(30, 100)));
}

#[tokio::test]
async fn cancelling_a_finished_scan_changes_nothing() {
    let engine = engine_with(Arc::new(MemoryStore::new()), FnProber(unreachable));
    let id = engine.start_scan("10.0.0.7", ScanType::Quick).await.unwrap();
    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Completed);

    let before = task(&engine, id).await;
    assert!(!engine.request_cancel(id).await.unwrap());
    assert!(!engine.request_cancel(id).await.unwrap());
    assert_eq!(task(&engine, id).await, before);
}

/// Answers every address as a live device and files a cancel request for
/// task 1 on its tenth call.
struct CancellingProber {
    store: Arc<MemoryStore>,
    calls: AtomicUsize,
}

#[async_trait]
impl Prober for CancellingProber {
    async fn probe(&self, ip: &str, _template: &ScanTemplate, _timeout: Duration) -> ProbeResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
            self.store.request_cancel(TaskId(1)).await.unwrap();
        }
        tokio::task::yield_now().await;
        let mut r = ProbeResult::completed(ip);
        r.host_up = true;
        r.ports.push(PortInfo::open(80, "tcp"));
        r
    }
}

#[tokio::test]
async fn cancel_mid_scan_stops_dispatch_and_keeps_earlier_results() {
    let store = Arc::new(MemoryStore::new());
    let prober = CancellingProber {
        store: store.clone(),
        calls: AtomicUsize::new(0),
    };
    let engine = engine_with(store.clone(), prober);
    let id = engine.start_scan("10.0.0.1-100", ScanType::Quick).await.unwrap();
    assert_eq!(id, TaskId(1));

    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Cancelled);
    let t = task(&engine, id).await;
    assert_eq!(t.status, TaskStatus::Cancelled);
    assert!(t.end_time.is_some());
    assert!(t.completed_ips < 100, "completed {}", t.completed_ips);
    assert!(t.completed_ips <= 12, "completed {}", t.completed_ips);

    let found = engine.discoveries(id).await.unwrap();
    assert!(found.len() as u64 <= t.completed_ips);
    assert_eq!(t.discovered_devices, found.len() as u64);
}

#[tokio::test]
async fn empty_target_fails_the_task() {
    let engine = engine_with(Arc::new(MemoryStore::new()), FnProber(unreachable));
    let id = engine.start_scan("  ", ScanType::Quick).await.unwrap();

    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Failed);
    let t = task(&engine, id).await;
    assert_eq!(t.error_message.as_deref(), Some("target is empty"));
    assert!(t.end_time.is_some());
}

#[tokio::test]
async fn missing_scan_tool_fails_the_task() {
    let prober = FnProber(|ip: &str| {
        ProbeResult::failed(ip, ProbeFailure::ToolUnavailable, "nmap: No such file or directory")
    });
    let engine = engine_with(Arc::new(MemoryStore::new()), prober);
    let id = engine.start_scan("10.0.0.1-20", ScanType::Quick).await.unwrap();

    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Failed);
    let t = task(&engine, id).await;
    let msg = t.error_message.unwrap_or_default();
    assert!(msg.contains("unavailable"), "{msg}");
    assert!(t.completed_ips < 20);
}

#[tokio::test]
async fn persistent_storage_failure_fails_the_task() {
    let store = Arc::new(RecordingStore {
        fail_discoveries: true,
        ..RecordingStore::default()
    });
    let prober = FnProber(|ip: &str| {
        let mut r = ProbeResult::completed(ip);
        r.host_up = true;
        r.mac_address = Some("AA:BB:CC:00:11:22".into());
        r
    });
    let engine = engine_with(store, prober);
    let id = engine.start_scan("10.0.0.1-3", ScanType::Quick).await.unwrap();

    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Failed);
    let t = task(&engine, id).await;
    let msg = t.error_message.unwrap_or_default();
    assert!(msg.contains("disk full"), "{msg}");
}

#[tokio::test]
async fn unknown_tasks_are_reported_missing() {
    let engine = engine_with(Arc::new(MemoryStore::new()), FnProber(unreachable));
    assert!(matches!(
        engine.get_progress(TaskId(42)).await,
        Err(EngineError::TaskNotFound(TaskId(42)))
    ));
    assert!(matches!(
        engine.request_cancel(TaskId(42)).await,
        Err(EngineError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn bad_template_ports_are_rejected_up_front() {
    let engine = engine_with(Arc::new(MemoryStore::new()), FnProber(unreachable));
    let mut req = scan_engine::ScanRequest::new("10.0.0.1", ScanType::Comprehensive);
    req.template = req.template.with_ports("22,99999");
    assert!(matches!(
        engine.start_scan_with(req).await,
        Err(EngineError::InvalidTemplate(_))
    ));
}

struct Hangs;

#[async_trait]
impl Prober for Hangs {
    async fn probe(&self, _ip: &str, _template: &ScanTemplate, _timeout: Duration) -> ProbeResult {
        std::future::pending::<ProbeResult>().await
    }
}

#[tokio::test]
async fn hung_probes_are_cut_off_by_the_scheduler() {
    let engine = engine_with(Arc::new(MemoryStore::new()), Hangs);
    let mut req = scan_engine::ScanRequest::new("10.0.0.1-4", ScanType::Quick);
    req.template = req.template.with_timeout(Duration::from_millis(50));
    let id = engine.start_scan_with(req).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), engine.wait(id))
        .await
        .expect("scan should finish despite hung probes")
        .unwrap();
    assert_eq!(status, TaskStatus::Completed);
    let t = task(&engine, id).await;
    assert_eq!((t.completed_ips, t.total_ips), (4, 4));
    assert!(engine.discoveries(id).await.unwrap().is_empty());
}

/// Only the gateway answers; records the timeout it was handed.
#[derive(Default)]
struct GatewayOnly {
    calls: AtomicUsize,
    timeout: Mutex<Option<Duration>>,
}

#[async_trait]
impl AliveCheck for GatewayOnly {
    async fn check(&self, ip: &str, timeout: Duration) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.timeout.lock().unwrap() = Some(timeout);
        let mut r = ProbeResult::completed(ip);
        if ip.ends_with(".1") {
            r.host_up = true;
            r.response_time = Some(0.4);
        }
        r
    }
}

struct CountingProber(AtomicUsize);

#[async_trait]
impl Prober for CountingProber {
    async fn probe(&self, ip: &str, _template: &ScanTemplate, _timeout: Duration) -> ProbeResult {
        self.0.fetch_add(1, Ordering::SeqCst);
        ProbeResult::completed(ip)
    }
}

#[tokio::test]
async fn auto_target_samples_around_the_anchor_with_alive_checks() {
    let alive = Arc::new(GatewayOnly::default());
    let prober = Arc::new(CountingProber(AtomicUsize::new(0)));
    let mut config = test_config();
    config.lan_anchor = Some(std::net::Ipv4Addr::new(192, 168, 50, 20));
    config.timeouts.alive_ms = 75;
    let engine = ScanEngine::new(
        Arc::new(MemoryStore::new()),
        prober.clone(),
        alive.clone(),
        config,
    );

    let id = engine.start_scan("auto", ScanType::Comprehensive).await.unwrap();
    assert_eq!(engine.wait(id).await.unwrap(), TaskStatus::Completed);

    let t = task(&engine, id).await;
    assert_eq!((t.total_ips, t.completed_ips), (64, 64));
    assert_eq!(alive.calls.load(Ordering::SeqCst), 64);
    assert_eq!(prober.0.load(Ordering::SeqCst), 0);
    assert_eq!(*alive.timeout.lock().unwrap(), Some(Duration::from_millis(75)));

    let found = engine.discoveries(id).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].ip, "192.168.50.1");
}
