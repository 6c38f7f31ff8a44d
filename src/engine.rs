//! Task lifecycle API: start a scan in the background, poll it, cancel it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ports;
use crate::probe::{AliveCheck, NmapProber, Prober, TcpAliveCheck};
use crate::scheduler::Scheduler;
use crate::store::{MemoryStore, TaskStore};
use crate::task::{TaskId, TaskStatus};
use crate::types::{Discovery, ProgressReport, ScanTemplate, ScanType};

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub target: String,
    pub template: ScanTemplate,
    /// Falls back to the configured default when unset.
    pub max_concurrency: Option<usize>,
}

impl ScanRequest {
    pub fn new(target: impl Into<String>, scan_type: ScanType) -> Self {
        Self {
            target: target.into(),
            template: ScanTemplate::new(scan_type),
            max_concurrency: None,
        }
    }
}

/// A running scan: its cancel switch and the background job driving it.
#[derive(Debug)]
pub struct ScanHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<TaskStatus>>,
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> Result<TaskStatus> {
        self.join.await?
    }
}

pub struct ScanEngine {
    store: Arc<dyn TaskStore>,
    scheduler: Scheduler,
    config: EngineConfig,
    jobs: Mutex<HashMap<TaskId, ScanHandle>>,
}

impl ScanEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        prober: Arc<dyn Prober>,
        alive: Arc<dyn AliveCheck>,
        config: EngineConfig,
    ) -> Self {
        let scheduler = Scheduler::new(store.clone(), prober, alive, config.clone());
        Self {
            store,
            scheduler,
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory store, nmap probes and TCP alive checks.
    pub fn with_nmap(config: EngineConfig) -> Self {
        let prober = NmapProber::new(config.nmap_path.clone())
            .with_snmp_community(config.snmp_community.clone());
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(prober),
            Arc::new(TcpAliveCheck::default()),
            config,
        )
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn start_scan(&self, target: &str, scan_type: ScanType) -> Result<TaskId> {
        self.start_scan_with(ScanRequest::new(target, scan_type)).await
    }

    /// Record the task and hand it to the scheduler in the background.
    pub async fn start_scan_with(&self, req: ScanRequest) -> Result<TaskId> {
        if let Some(list) = req.template.ports.as_deref() {
            ports::parse_ports_str(list)
                .map_err(|e| EngineError::InvalidTemplate(format!("{e:#}")))?;
        }

        let task_id = self
            .store
            .create_scan_task(&req.target, &req.template)
            .await?;
        let concurrency = self.config.effective_concurrency(req.max_concurrency);
        let cancel = CancellationToken::new();

        let scheduler = self.scheduler.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            scheduler
                .run(task_id, &req.target, &req.template, concurrency, token)
                .await
        });

        let mut jobs = self.jobs.lock().await;
        jobs.retain(|_, h| !h.is_finished());
        jobs.insert(task_id, ScanHandle { cancel, join });
        info!(task_id = %task_id, concurrency, "scan queued");
        Ok(task_id)
    }

    pub async fn get_progress(&self, task_id: TaskId) -> Result<ProgressReport> {
        Ok(self.store.get_task(task_id).await?.report())
    }

    /// Ask a scan to stop. Returns false when the task had already ended.
    pub async fn request_cancel(&self, task_id: TaskId) -> Result<bool> {
        let changed = self.store.request_cancel(task_id).await?;
        if changed {
            if let Some(handle) = self.jobs.lock().await.get(&task_id) {
                handle.cancel();
            }
            info!(task_id = %task_id, "cancellation requested");
        }
        Ok(changed)
    }

    pub async fn discoveries(&self, task_id: TaskId) -> Result<Vec<Discovery>> {
        self.store.list_discoveries(task_id).await
    }

    /// Wait for a scan's background job. Tasks without a live job report
    /// their stored status.
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskStatus> {
        let handle = self.jobs.lock().await.remove(&task_id);
        match handle {
            Some(handle) => handle.join().await,
            None => Ok(self.store.get_task(task_id).await?.status),
        }
    }
}
