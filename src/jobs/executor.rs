//! Drives one job's blocking work under a timeout and a cancel flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::tasks::UpdateSender;

/// How often an abandoned-by-operator job is noticed while the work is
/// still busy inside the detector.
const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum DriveOutcome<T> {
    Finished(anyhow::Result<T>),
    /// The timeout elapsed first. The work was told to stop; whatever it
    /// produces later is dropped.
    TimedOut,
    /// The cancel flag was raised by an operator.
    Cancelled,
}

/// Runs `work` on a blocking thread and waits for it, forwarding progress
/// percentages to `on_progress` in the order they were reported.
pub async fn drive<T, W, P>(
    work: W,
    cancel_flag: Arc<AtomicBool>,
    timeout: Duration,
    mut on_progress: P,
) -> DriveOutcome<T>
where
    T: Send + 'static,
    W: FnOnce(UpdateSender, Arc<AtomicBool>) -> anyhow::Result<T> + Send + 'static,
    P: FnMut(u8),
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let flag = cancel_flag.clone();
    let mut handle = tokio::task::spawn_blocking(move || work(tx, flag));

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(CANCEL_POLL);
    let mut updates_open = true;

    loop {
        tokio::select! {
            joined = &mut handle => {
                while let Ok(p) = rx.try_recv() {
                    on_progress(p.percent());
                }
                if cancel_flag.load(Ordering::SeqCst) {
                    return DriveOutcome::Cancelled;
                }
                return DriveOutcome::Finished(
                    joined.unwrap_or_else(|e| Err(anyhow!("job worker panicked: {}", e))),
                );
            }
            update = rx.recv(), if updates_open => match update {
                Some(p) => on_progress(p.percent()),
                None => updates_open = false,
            },
            _ = poll.tick() => {
                if cancel_flag.load(Ordering::SeqCst) {
                    return DriveOutcome::Cancelled;
                }
            }
            _ = &mut deadline => {
                cancel_flag.store(true, Ordering::SeqCst);
                return DriveOutcome::TimedOut;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskProgress;

    #[tokio::test]
    async fn test_finished_with_progress() {
        let mut seen = Vec::new();
        let outcome = drive(
            |updates, _| {
                for i in 1..=4 {
                    let _ = updates.send(TaskProgress::new(i, 4));
                }
                Ok(42)
            },
            Arc::new(AtomicBool::new(false)),
            Duration::from_secs(5),
            |p| seen.push(p),
        )
        .await;

        assert!(matches!(outcome, DriveOutcome::Finished(Ok(42))));
        assert_eq!(seen, vec![25, 50, 75, 100]);
    }

    #[tokio::test]
    async fn test_timeout_raises_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let outcome: DriveOutcome<()> = drive(
            |_, cancel| {
                while !cancel.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            },
            flag.clone(),
            Duration::from_millis(50),
            |_| {},
        )
        .await;

        assert!(matches!(outcome, DriveOutcome::TimedOut));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_while_work_is_stuck() {
        let flag = Arc::new(AtomicBool::new(false));
        let raise = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            raise.store(true, Ordering::SeqCst);
        });

        let outcome: DriveOutcome<()> = drive(
            |_, _| {
                // Ignores the flag entirely.
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            },
            flag,
            Duration::from_secs(5),
            |_| {},
        )
        .await;
        assert!(matches!(outcome, DriveOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_work_error_is_returned() {
        let outcome: DriveOutcome<()> = drive(
            |_, _| Err(anyhow!("decoder error")),
            Arc::new(AtomicBool::new(false)),
            Duration::from_secs(5),
            |_| {},
        )
        .await;
        match outcome {
            DriveOutcome::Finished(Err(e)) => assert_eq!(e.to_string(), "decoder error"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
