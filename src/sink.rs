use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::store::{with_retries, TaskStore};
use crate::task::TaskId;
use crate::types::{Discovery, ProbeResult};

/// Persists classified hosts as discovery records.
#[derive(Clone)]
pub struct ResultSink {
    store: Arc<dyn TaskStore>,
    retries: u32,
    backoff: Duration,
}

impl ResultSink {
    pub fn new(store: Arc<dyn TaskStore>, retries: u32, backoff: Duration) -> Self {
        Self {
            store,
            retries,
            backoff,
        }
    }

    pub async fn record(&self, task_id: TaskId, result: ProbeResult) -> Result<Discovery> {
        let discovery = Discovery::from_probe(task_id, result);
        with_retries(self.retries, self.backoff, "insert discovery", || {
            self.store.insert_discovery(discovery.clone())
        })
        .await?;
        debug!(task_id = %task_id, ip = %discovery.ip, "device recorded");
        Ok(discovery)
    }
}
