//! Background job execution primitives.
//!
//! Blocking job work reports progress to its async owner over a channel and
//! watches a shared cancel flag; the owner is the only writer of the job row.

pub mod manager;
pub mod pool;

use tokio::sync::mpsc;

pub use manager::{RunningGuard, RunningJobs};
pub use pool::{SubmitError, WorkerPool};

/// Progress information for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self { current, total }
    }

    /// Calculate progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// Progress reports sent from background work to the job's owner.
pub type UpdateSender = mpsc::UnboundedSender<TaskProgress>;
