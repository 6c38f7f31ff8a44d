//! Library crate for scan-engine: expands scan targets, probes hosts on a
//! bounded worker pool, classifies what answered and tracks each scan as a
//! cancellable task.
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod netdetect;
pub mod nmap;
pub mod ports;
pub mod probe;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod store;
pub mod target;
pub mod task;
pub mod types;

pub use engine::{ScanEngine, ScanRequest};
pub use error::{EngineError, Result};
pub use task::{ScanTask, TaskId, TaskStatus};
pub use types::{Discovery, ProbeResult, ScanTemplate, ScanType};
