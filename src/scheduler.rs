//! Concurrent scan scheduler.
//!
//! Drives one scan task from expansion to a terminal state. Probes run on a
//! bounded pool (a `Semaphore` sized to `max_concurrency`, workers in a
//! `JoinSet`), while this loop is the only writer of the task's progress and
//! discoveries. Cancellation is cooperative: it is checked before every
//! dispatch and before every result is persisted, and anything that finishes
//! after it was observed is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::netdetect::LanSampling;
use crate::probe::{AliveCheck, Prober};
use crate::sink::ResultSink;
use crate::store::{with_retries, TaskStore};
use crate::target::{ExpandOptions, Target};
use crate::task::{progress_percent, TaskId, TaskStatus, TerminalUpdate};
use crate::types::{ProbeFailure, ProbeResult, ScanTemplate};

/// Slack on top of the per-host timeout before the scheduler gives up on a
/// prober that ignores its own deadline.
const PROBE_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    prober: Arc<dyn Prober>,
    alive: Arc<dyn AliveCheck>,
    sink: ResultSink,
    config: EngineConfig,
}

enum SweepEnd {
    Exhausted,
    Cancelled,
}

/// Counters owned by the dispatch loop.
struct SweepState {
    total: u64,
    completed: u64,
    /// Results before the tool is considered missing for good.
    first_wave: u64,
    unavailable: u64,
    tool_worked: bool,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        prober: Arc<dyn Prober>,
        alive: Arc<dyn AliveCheck>,
        config: EngineConfig,
    ) -> Self {
        let sink = ResultSink::new(store.clone(), config.storage_retries, config.retry_backoff());
        Self {
            store,
            prober,
            alive,
            sink,
            config,
        }
    }

    /// Run `task_id` to a terminal state and return it.
    ///
    /// Only fails when even the terminal write could not be stored.
    pub async fn run(
        &self,
        task_id: TaskId,
        target: &str,
        template: &ScanTemplate,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<TaskStatus> {
        let max_concurrency = max_concurrency.max(1);
        info!(task_id = %task_id, targets = target, scan_type = %template.scan_type, max_concurrency, "scan starting");

        let opts = ExpandOptions {
            max_targets: self.config.max_targets,
            lan: LanSampling {
                depth: self.config.lan_depth,
                max_candidates: self.config.lan_max_candidates,
            },
            local: self.config.lan_anchor,
        };
        let expanded = Target::parse(target).and_then(|t| Ok((t.is_lan(), t.expand(&opts)?)));
        let (lan, ips) = match expanded {
            Ok(v) => v,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "target expansion failed");
                return self.finish(task_id, TaskStatus::Failed, Some(e.to_string())).await;
            }
        };

        let total = ips.len() as u64;
        match self.retry("start task", || self.store.start_task(task_id, total)).await {
            Ok(()) => {}
            Err(EngineError::InvalidTransition {
                from: TaskStatus::Cancelled,
                ..
            }) => return self.finish(task_id, TaskStatus::Cancelled, None).await,
            Err(e) => return self.finish(task_id, TaskStatus::Failed, Some(e.to_string())).await,
        }
        info!(task_id = %task_id, total, lan, "targets expanded");

        match self
            .sweep(task_id, ips, lan, template, max_concurrency, &cancel)
            .await
        {
            Ok(SweepEnd::Exhausted) => self.finish(task_id, TaskStatus::Completed, None).await,
            Ok(SweepEnd::Cancelled) => self.finish(task_id, TaskStatus::Cancelled, None).await,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "scan aborted");
                self.finish(task_id, TaskStatus::Failed, Some(e.to_string())).await
            }
        }
    }

    async fn sweep(
        &self,
        task_id: TaskId,
        ips: Vec<String>,
        lan: bool,
        template: &ScanTemplate,
        max_concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<SweepEnd> {
        let total = ips.len() as u64;
        let mut state = SweepState {
            total,
            completed: 0,
            first_wave: total.min(max_concurrency as u64),
            unavailable: 0,
            tool_worked: false,
        };

        let timeout = if lan {
            self.config.timeouts.alive()
        } else {
            template
                .timeout
                .unwrap_or_else(|| self.config.timeouts.for_scan_type(template.scan_type))
        };
        let template = Arc::new(template.clone());
        let sem = Arc::new(Semaphore::new(max_concurrency));
        let mut set: JoinSet<ProbeResult> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, String> = HashMap::new();
        let mut cancelled = false;

        for ip in ips {
            if self.cancel_observed(task_id, cancel).await? {
                cancelled = true;
                break;
            }

            // wait for a free slot, absorbing whatever finishes meanwhile
            let permit = loop {
                tokio::select! {
                    biased;
                    Some(joined) = set.join_next_with_id(), if !set.is_empty() => {
                        self.absorb(task_id, joined, &mut in_flight, &mut state, cancel).await?;
                    }
                    permit = sem.clone().acquire_owned() => {
                        break permit.expect("semaphore in scope");
                    }
                }
            };
            if self.cancel_observed(task_id, cancel).await? {
                cancelled = true;
                break;
            }

            let prober = self.prober.clone();
            let alive = self.alive.clone();
            let template = template.clone();
            let target = ip.clone();
            let handle = set.spawn(async move {
                let _permit = permit; // keep permit until the probe is done
                let work = async {
                    if lan {
                        alive.check(&target, timeout).await
                    } else {
                        prober.probe(&target, &template, timeout).await
                    }
                };
                let outcome = time::timeout(timeout + PROBE_GRACE, work).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => ProbeResult::timeout(target),
                }
            });
            in_flight.insert(handle.id(), ip);
        }

        // in-flight probes may finish; after a cancel their results are dropped
        while let Some(joined) = set.join_next_with_id().await {
            self.absorb(task_id, joined, &mut in_flight, &mut state, cancel)
                .await?;
        }

        if cancelled || self.cancel_observed(task_id, cancel).await? {
            info!(task_id = %task_id, completed = state.completed, total, "scan cancelled");
            return Ok(SweepEnd::Cancelled);
        }
        Ok(SweepEnd::Exhausted)
    }

    /// Fold one finished probe into the task: classify, persist, count.
    async fn absorb(
        &self,
        task_id: TaskId,
        joined: std::result::Result<(task::Id, ProbeResult), JoinError>,
        in_flight: &mut HashMap<task::Id, String>,
        state: &mut SweepState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = match joined {
            Ok((id, result)) => {
                in_flight.remove(&id);
                result
            }
            Err(e) => {
                let ip = in_flight.remove(&e.id()).unwrap_or_default();
                warn!(task_id = %task_id, ip = %ip, error = %e, "probe worker died");
                ProbeResult::failed(ip, ProbeFailure::ToolError, e.to_string())
            }
        };

        if self.cancel_observed(task_id, cancel).await? {
            debug!(task_id = %task_id, ip = %result.ip, "dropping result after cancellation");
            return Ok(());
        }

        if result.failure == Some(ProbeFailure::ToolUnavailable) {
            state.unavailable += 1;
            if !state.tool_worked && state.unavailable >= state.first_wave {
                let msg = result.error.unwrap_or_else(|| "scan tool unavailable".into());
                return Err(EngineError::ToolUnavailable(msg));
            }
        } else {
            state.tool_worked = true;
        }

        let ip = result.ip.clone();
        let device = classify::is_device(&result);
        debug!(task_id = %task_id, ip = %ip, status = ?result.status, device, error = ?result.error, "probe finished");

        if device {
            match self.sink.record(task_id, result).await {
                Ok(_) => {}
                // the task left `running` under us: a cancel landed
                Err(EngineError::InvalidTransition { .. }) => {
                    cancel.cancel();
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let completed = state.completed + 1;
        let progress = progress_percent(completed, state.total);
        match self
            .retry("update progress", || {
                self.store
                    .update_task_progress(task_id, completed, &ip, progress)
            })
            .await
        {
            Ok(()) => state.completed = completed,
            Err(EngineError::InvalidTransition { .. }) => cancel.cancel(),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Token first, then the persisted status; a persisted cancel trips the token.
    async fn cancel_observed(&self, task_id: TaskId, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Ok(true);
        }
        if self
            .retry("poll cancellation", || self.store.is_cancelled(task_id))
            .await?
        {
            cancel.cancel();
            return Ok(true);
        }
        Ok(false)
    }

    async fn finish(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<TaskStatus> {
        let discovered = self
            .retry("count discoveries", || self.store.count_discoveries(task_id))
            .await
            .unwrap_or_else(|e| {
                warn!(task_id = %task_id, error = %e, "could not count discoveries");
                0
            });

        let update = match status {
            TaskStatus::Completed => TerminalUpdate::completed(discovered),
            TaskStatus::Cancelled => TerminalUpdate::cancelled(discovered),
            _ => TerminalUpdate::failed(
                discovered,
                error_message.unwrap_or_else(|| "scan failed".into()),
            ),
        };

        let stored = self
            .retry("finish task", || {
                self.store.set_task_terminal(task_id, update.clone())
            })
            .await;
        let status = match stored {
            Ok(()) => status,
            // a cancel request raced the last write; honour it
            Err(EngineError::InvalidTransition {
                from: TaskStatus::Cancelled,
                ..
            }) if status != TaskStatus::Cancelled => {
                self.retry("finish task", || {
                    self.store
                        .set_task_terminal(task_id, TerminalUpdate::cancelled(discovered))
                })
                .await?;
                TaskStatus::Cancelled
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "could not record terminal state");
                return Err(e);
            }
        };

        info!(task_id = %task_id, status = %status, discovered, "scan finished");
        Ok(status)
    }

    async fn retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        with_retries(
            self.config.storage_retries,
            self.config.retry_backoff(),
            what,
            op,
        )
        .await
    }
}
