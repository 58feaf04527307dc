//! Registry of jobs currently owned by a worker, for operator cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::JobKind;

type JobKey = (JobKind, i64);

/// Cancel flags of running jobs, keyed by kind and id.
#[derive(Default)]
pub struct RunningJobs {
    flags: Mutex<HashMap<JobKey, Arc<AtomicBool>>>,
}

impl RunningJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn flags(&self) -> MutexGuard<'_, HashMap<JobKey, Arc<AtomicBool>>> {
        // The map stays consistent even if a holder panicked.
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a job picked up by a worker. The returned guard removes the
    /// entry when the worker is done with the job.
    pub fn register(self: &Arc<Self>, kind: JobKind, id: i64) -> RunningGuard {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.flags().insert((kind, id), cancel_flag.clone());
        RunningGuard {
            registry: self.clone(),
            key: (kind, id),
            cancel_flag,
        }
    }

    /// Raises the cancel flag of a registered job.
    pub fn cancel(&self, kind: JobKind, id: i64) -> bool {
        match self.flags().get(&(kind, id)) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for flag in self.flags().values() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn len(&self) -> usize {
        self.flags().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RunningGuard {
    registry: Arc<RunningJobs>,
    key: JobKey,
    cancel_flag: Arc<AtomicBool>,
}

impl RunningGuard {
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.registry.flags().remove(&self.key);
    }
}
