//! Scan task record and its lifecycle.
//!
//! ```text
//! pending -> running -> completed
//!    |          |-----> cancelled
//!    |          '-----> failed
//!    '--> cancelled | failed
//! ```
//!
//! A cancel request flips the status to `cancelled` straight away; the
//! scheduler later finalizes the record (end time, discovered count). Nothing
//! moves once a terminal record is finalized.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{EngineError, Result};
use crate::types::{ProgressReport, ScanTemplate};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `floor(100 * completed / total)`, or 0 for an empty task.
pub fn progress_percent(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed.min(total) * 100) / total) as u8
}

/// Final write for a task leaving the running state.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalUpdate {
    pub status: TaskStatus,
    pub end_time: OffsetDateTime,
    pub discovered_devices: u64,
    pub error_message: Option<String>,
}

impl TerminalUpdate {
    pub fn completed(discovered_devices: u64) -> Self {
        Self::new(TaskStatus::Completed, discovered_devices, None)
    }

    pub fn cancelled(discovered_devices: u64) -> Self {
        Self::new(TaskStatus::Cancelled, discovered_devices, None)
    }

    pub fn failed(discovered_devices: u64, message: impl Into<String>) -> Self {
        Self::new(TaskStatus::Failed, discovered_devices, Some(message.into()))
    }

    fn new(status: TaskStatus, discovered_devices: u64, error_message: Option<String>) -> Self {
        Self {
            status,
            end_time: OffsetDateTime::now_utc(),
            discovered_devices,
            error_message,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanTask {
    pub id: TaskId,
    pub target: String,
    pub template: ScanTemplate,
    pub status: TaskStatus,
    pub total_ips: u64,
    pub completed_ips: u64,
    pub current_ip: Option<String>,
    pub progress: u8,
    pub discovered_devices: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl ScanTask {
    pub fn new(id: TaskId, target: impl Into<String>, template: ScanTemplate) -> Self {
        Self {
            id,
            target: target.into(),
            template,
            status: TaskStatus::Pending,
            total_ips: 0,
            completed_ips: 0,
            current_ip: None,
            progress: 0,
            discovered_devices: 0,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }

    /// Terminal and finalized: no field changes from here on.
    pub fn is_sealed(&self) -> bool {
        self.status.is_terminal() && self.end_time.is_some()
    }

    pub fn start(&mut self, total_ips: u64) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.transition_error(TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.start_time = Some(OffsetDateTime::now_utc());
        self.total_ips = total_ips;
        Ok(())
    }

    /// Counters move together so a reader never sees a torn update.
    pub fn record_progress(&mut self, completed_ips: u64, current_ip: &str) -> Result<()> {
        if self.status != TaskStatus::Running {
            return Err(self.transition_error(TaskStatus::Running));
        }
        if completed_ips > self.total_ips || completed_ips < self.completed_ips {
            return Err(EngineError::InvalidProgress {
                completed: completed_ips,
                total: self.total_ips,
            });
        }
        self.completed_ips = completed_ips;
        self.current_ip = Some(current_ip.to_string());
        self.progress = progress_percent(completed_ips, self.total_ips);
        Ok(())
    }

    /// Flip to `cancelled` if the task has not ended yet. Returns whether it did.
    pub fn request_cancel(&mut self) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::Running => {
                self.status = TaskStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    pub fn finish(&mut self, update: TerminalUpdate) -> Result<()> {
        let allowed = match (self.status, update.status) {
            (_, to) if !to.is_terminal() => false,
            (TaskStatus::Running, _) => true,
            (TaskStatus::Pending, to) => to != TaskStatus::Completed,
            // cancel requested, scheduler has not signed off yet
            (TaskStatus::Cancelled, TaskStatus::Cancelled) => self.end_time.is_none(),
            _ => false,
        };
        if !allowed {
            return Err(self.transition_error(update.status));
        }

        if update.status == TaskStatus::Completed {
            self.completed_ips = self.total_ips;
            self.progress = 100;
        }
        self.status = update.status;
        self.end_time = Some(update.end_time);
        self.discovered_devices = update.discovered_devices;
        self.error_message = update.error_message;
        Ok(())
    }

    pub fn report(&self) -> ProgressReport {
        ProgressReport {
            task_id: self.id,
            status: self.status,
            progress: self.progress,
            total_ips: self.total_ips,
            completed_ips: self.completed_ips,
            current_ip: self.current_ip.clone(),
            discovered_devices: self.discovered_devices,
            error_message: self.error_message.clone(),
        }
    }

    fn transition_error(&self, to: TaskStatus) -> EngineError {
        EngineError::InvalidTransition {
            from: self.status,
            to,
        }
    }
}
