//! Bounded pool for background store writes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::types::Result;

/// The floor for background upload timeouts. Uploads run detached from the
/// originating request's cancellation so a toolchain exiting does not abort
/// in-flight writes; the timeout bounds them instead.
const MIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs fallible background tasks with bounded concurrency and a per-task
/// timeout. Task failures are logged and counted, never surfaced to the
/// caller; the local tier has already satisfied the request by the time a
/// task runs.
pub struct Uploader {
    sem: Arc<Semaphore>,
    timeout: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl Uploader {
    /// `limit` = 0 means one worker per CPU.
    pub fn new(limit: usize, timeout: Duration) -> Self {
        let limit = if limit == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            limit
        };
        Self {
            sem: Arc::new(Semaphore::new(limit)),
            timeout: timeout.max(MIN_TIMEOUT),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Enqueue a background task. Returns once the task is spawned; the
    /// concurrency permit is acquired inside the task so enqueueing never
    /// blocks beyond brief lock contention.
    pub async fn spawn<F>(&self, label: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let sem = Arc::clone(&self.sem);
        let timeout = self.timeout;
        let mut tasks = self.tasks.lock().await;
        // Reap whatever has already finished so the set does not grow
        // without bound in a long-lived process.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = label, error = %e, "background upload failed"),
                Err(_) => warn!(task = label, timeout_secs = timeout.as_secs(), "background upload timed out"),
            }
        });
    }

    /// Block until every outstanding task has finished.
    pub async fn wait(&self) {
        let mut tasks = self.tasks.lock().await;
        let mut drained = 0usize;
        while tasks.join_next().await.is_some() {
            drained += 1;
        }
        debug!(drained, "uploader drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn tasks_run_and_drain() {
        let up = Uploader::new(2, Duration::from_secs(60));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            up.spawn("test", async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        }
        up.wait().await;
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn errors_do_not_propagate() {
        let up = Uploader::new(1, Duration::from_secs(60));
        up.spawn("failing", async { Err(crate::types::Error::Store("nope".into())) })
            .await;
        up.wait().await;
    }

    #[test]
    fn timeout_has_a_floor() {
        let up = Uploader::new(1, Duration::from_secs(1));
        assert_eq!(up.timeout, MIN_TIMEOUT);
        let up = Uploader::new(1, Duration::from_secs(120));
        assert_eq!(up.timeout, Duration::from_secs(120));
    }
}
