//! First-of-two-tasks-to-complete combinator.
//!
//! The task is spawned onto the runtime and raced against a timer. When the
//! timer wins the task is detached, not aborted: it keeps running and its
//! result is dropped whenever it eventually resolves. Callers that need the
//! work to stop must not rely on this combinator for it.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutcome<T> {
    Completed(T),
    TimedOut,
    /// The spawned task panicked.
    Failed,
}

pub async fn first_to_complete<F>(task: F, deadline: Duration) -> RaceOutcome<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let handle = tokio::spawn(task);
    let timer = tokio::time::sleep(deadline);

    tokio::select! {
        joined = handle => match joined {
            Ok(value) => RaceOutcome::Completed(value),
            Err(e) => {
                warn!("raced task failed: {}", e);
                RaceOutcome::Failed
            }
        },
        _ = timer => {
            // Dropping the JoinHandle detaches the task.
            debug!(deadline_ms = deadline.as_millis() as u64, "race deadline reached first");
            RaceOutcome::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fast_task_wins() {
        let outcome = first_to_complete(async { 7 }, Duration::from_secs(1)).await;
        assert_eq!(outcome, RaceOutcome::Completed(7));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_task_times_out() {
        let outcome = first_to_complete(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                1
            },
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(outcome, RaceOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn losing_task_keeps_running() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let outcome = first_to_complete(
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
            },
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, RaceOutcome::TimedOut);
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_task_reports_failure() {
        let outcome: RaceOutcome<()> =
            first_to_complete(async { panic!("boom") }, Duration::from_secs(1)).await;
        assert_eq!(outcome, RaceOutcome::Failed);
    }
}
