use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Errors raised by the scan engine and its storage collaborator.
///
/// Per-host probe failures are not represented here: they travel inside a
/// failed [`ProbeResult`](crate::types::ProbeResult) and never abort a scan.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("target is empty")]
    EmptyTarget,
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("target {target} expands to {hosts} hosts, above the configured limit")]
    TargetTooLarge { target: String, hosts: u64 },
    #[error("invalid scan template: {0}")]
    InvalidTemplate(String),
    #[error("scan task {0} not found")]
    TaskNotFound(TaskId),
    #[error("invalid task transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("progress {completed}/{total} out of bounds")]
    InvalidProgress { completed: u64, total: u64 },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("scan tool unavailable: {0}")]
    ToolUnavailable(String),
    #[error("malformed tool output: {0}")]
    MalformedOutput(String),
    #[error("scan worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Storage failures are retried; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
