//! Fixed-size worker pool fed by a bounded queue.
//!
//! At most `workers` jobs run at once; submitted jobs wait in the queue
//! (still `pending` in the store) until a worker is free. Submission never
//! blocks: a full queue is reported to the caller.

use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("job queue is full")]
    Full,
    #[error("worker pool is shut down")]
    Closed,
}

pub struct WorkerPool<J> {
    name: &'static str,
    sender: Mutex<Option<mpsc::Sender<J>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawns `workers` tasks on the current tokio runtime.
    pub fn start<F, Fut>(name: &'static str, workers: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handler = Arc::new(handler);

        let handles = (0..workers.max(1))
            .map(|i| {
                let rx = rx.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    tracing::debug!(pool = name, worker = i, "Worker started");
                    loop {
                        // Only one idle worker waits on the queue at a time.
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => handler(job).await,
                            None => break,
                        }
                    }
                    tracing::debug!(pool = name, worker = i, "Worker stopped");
                })
            })
            .collect();

        Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn submit(&self, job: J) -> Result<(), SubmitError> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(SubmitError::Closed);
        };
        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Stops accepting jobs, lets queued jobs drain and waits for workers.
    pub async fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handles: Vec<_> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(pool = self.name, error = %e, "Worker panicked");
            }
        }
    }
}
