//! Background workers: the generic runtime, the concrete detector and
//! processing workers, and the manager supervising them.
//!
//! Every worker runs on its own OS thread with its own store session. The
//! flow of one job through the system:
//!
//! ```text
//! JobRecord (idle/pending/failed) --detector--> QueueEntry (pending)
//!     --processing worker claims--> running --collaborator--> completed/failed
//! ```

pub mod claim;
pub mod detector;
pub mod import;
pub mod manager;
pub mod parsing;
pub mod runtime;

#[cfg(test)]
pub(crate) mod test_support;

pub use claim::{ClaimedJob, abandon_owned, claim_job};
pub use detector::JobDetector;
pub use import::ImportWorker;
pub use manager::{ManagerSettings, MonitorReport, SystemStatus, WorkerManager, WorkerSpec};
pub use parsing::ParsingWorker;
pub use runtime::{Lifecycle, RuntimeSettings, Worker, WorkerHandle, WorkerRunner, WorkerStatus};

use crate::jobs::StoreError;

/// Error ending one worker cycle.
///
/// Failures of a single job never surface here; they are recorded on the job.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// No usable store session for this cycle.
    #[error("store session unavailable: {0}")]
    SessionUnavailable(String),
}

impl WorkerError {
    /// Whether the worker should discard its session and open a new one.
    pub fn needs_refresh(&self) -> bool {
        match self {
            WorkerError::Store(err) => err.needs_refresh(),
            WorkerError::SessionUnavailable(_) => true,
        }
    }
}
