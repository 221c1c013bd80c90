//! Acquisition Worker Supervisor
//!
//! Owns the one telemetry acquisition worker a server instance may run.
//! Start, stop and status are serialized by a single lock; a stop with no
//! tracked worker falls back to scanning for orphans left by an earlier
//! instance.

mod scanner;
mod supervisor;

pub use scanner::{ProcessScanner, SysinfoScanner, WorkerSignature};
pub use supervisor::{StartReport, StopOutcome, Supervisor, SupervisorConfig, WorkerStatus};

use thiserror::Error;

/// Worker lifecycle errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to launch worker '{program}': {reason}")]
    Spawn { program: String, reason: String },
    #[error("Failed to terminate worker {pid}: {reason}")]
    Terminate { pid: u32, reason: String },
    #[error("Failed to force-kill worker {pid}: {reason}")]
    ForceKill { pid: u32, reason: String },
    #[error("Process scan failed: {0}")]
    Scan(String),
}
