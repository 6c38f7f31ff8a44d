//! Storage collaborator.
//!
//! [`TaskStore`] is the persistence boundary the engine drives: task rows and
//! append-only discovery records. [`MemoryStore`] is the in-process
//! implementation used by the CLI, the HTTP server and the tests. All
//! lifecycle rules are enforced by [`ScanTask`] itself, so any backend that
//! routes writes through it inherits them.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::task::{progress_percent, ScanTask, TaskId, TaskStatus, TerminalUpdate};
use crate::types::{Discovery, ScanTemplate};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_scan_task(&self, target: &str, template: &ScanTemplate) -> Result<TaskId>;

    async fn get_task(&self, id: TaskId) -> Result<ScanTask>;

    /// `pending -> running` with the expanded work-list size.
    async fn start_task(&self, id: TaskId, total_ips: u64) -> Result<()>;

    /// Writes the three progress fields in one step.
    async fn update_task_progress(
        &self,
        id: TaskId,
        completed_ips: u64,
        current_ip: &str,
        progress: u8,
    ) -> Result<()>;

    async fn set_task_terminal(&self, id: TaskId, update: TerminalUpdate) -> Result<()>;

    /// Append one discovery. Refused once the owning task left `running`.
    async fn insert_discovery(&self, discovery: Discovery) -> Result<()>;

    async fn list_discoveries(&self, id: TaskId) -> Result<Vec<Discovery>>;

    async fn count_discoveries(&self, id: TaskId) -> Result<u64> {
        Ok(self.list_discoveries(id).await?.len() as u64)
    }

    /// Mark a task cancelled. No effect (returns false) once it has ended.
    async fn request_cancel(&self, id: TaskId) -> Result<bool>;

    async fn is_cancelled(&self, id: TaskId) -> Result<bool> {
        Ok(self.get_task(id).await?.status == TaskStatus::Cancelled)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    tasks: HashMap<TaskId, ScanTask>,
    discoveries: HashMap<TaskId, Vec<Discovery>>,
}

impl StoreState {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut ScanTask> {
        self.tasks.get_mut(&id).ok_or(EngineError::TaskNotFound(id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_scan_task(&self, target: &str, template: &ScanTemplate) -> Result<TaskId> {
        let mut s = self.inner.write().await;
        s.next_id += 1;
        let id = TaskId(s.next_id);
        s.tasks.insert(id, ScanTask::new(id, target, template.clone()));
        Ok(id)
    }

    async fn get_task(&self, id: TaskId) -> Result<ScanTask> {
        let s = self.inner.read().await;
        s.tasks.get(&id).cloned().ok_or(EngineError::TaskNotFound(id))
    }

    async fn start_task(&self, id: TaskId, total_ips: u64) -> Result<()> {
        self.inner.write().await.task_mut(id)?.start(total_ips)
    }

    async fn update_task_progress(
        &self,
        id: TaskId,
        completed_ips: u64,
        current_ip: &str,
        progress: u8,
    ) -> Result<()> {
        let mut s = self.inner.write().await;
        let task = s.task_mut(id)?;
        if progress != progress_percent(completed_ips, task.total_ips) {
            return Err(EngineError::InvalidProgress {
                completed: completed_ips,
                total: task.total_ips,
            });
        }
        task.record_progress(completed_ips, current_ip)
    }

    async fn set_task_terminal(&self, id: TaskId, update: TerminalUpdate) -> Result<()> {
        self.inner.write().await.task_mut(id)?.finish(update)
    }

    async fn insert_discovery(&self, discovery: Discovery) -> Result<()> {
        let mut s = self.inner.write().await;
        let id = discovery.scan_task_id;
        let status = s.task_mut(id)?.status;
        if status != TaskStatus::Running {
            return Err(EngineError::InvalidTransition {
                from: status,
                to: TaskStatus::Running,
            });
        }
        let records = s.discoveries.entry(id).or_default();
        if records.iter().any(|d| d.ip == discovery.ip) {
            debug!(task_id = %id, ip = %discovery.ip, "discovery already recorded");
            return Ok(());
        }
        records.push(discovery);
        Ok(())
    }

    async fn list_discoveries(&self, id: TaskId) -> Result<Vec<Discovery>> {
        let s = self.inner.read().await;
        if !s.tasks.contains_key(&id) {
            return Err(EngineError::TaskNotFound(id));
        }
        Ok(s.discoveries.get(&id).cloned().unwrap_or_default())
    }

    async fn count_discoveries(&self, id: TaskId) -> Result<u64> {
        let s = self.inner.read().await;
        if !s.tasks.contains_key(&id) {
            return Err(EngineError::TaskNotFound(id));
        }
        Ok(s.discoveries.get(&id).map_or(0, |d| d.len() as u64))
    }

    async fn request_cancel(&self, id: TaskId) -> Result<bool> {
        Ok(self.inner.write().await.task_mut(id)?.request_cancel())
    }
}

/// Run a storage call, retrying transient failures up to `retries` more times
/// with linear backoff. Non-transient errors are returned immediately.
pub async fn with_retries<T, F, Fut>(
    retries: u32,
    backoff: Duration,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(attempt, error = %e, "{what} failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
