//! Tracking of fire-and-forget background work.
//!
//! Log fan-out, query result forwarding and carve archival run off the
//! request path. The registry keeps their handles so that panics are logged
//! and counted instead of vanishing, and so shutdown can wait for them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Interval between watchdog sweeps.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

struct TrackedTask {
    kind: &'static str,
    handle: JoinHandle<()>,
}

/// Registry of spawned background tasks.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<u64, TrackedTask>>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` and track it under `kind`.
    pub async fn spawn<F>(&self, kind: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        crate::metrics::BACKGROUND_TASKS_ACTIVE.inc();
        self.tasks.lock().await.insert(id, TrackedTask { kind, handle });
    }

    /// Number of tracked tasks, finished or not.
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawn a watchdog that reaps finished tasks periodically.
    /// The caller keeps the handle alive for the life of the server.
    pub fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_INTERVAL).await;
                self.reap().await;
            }
        })
    }

    /// Collect finished tasks and report their outcome.
    /// Returns the number of tasks reaped.
    pub async fn reap(&self) -> usize {
        let finished: Vec<TrackedTask> = {
            let mut tasks = self.tasks.lock().await;
            let ids: Vec<u64> = tasks
                .iter()
                .filter(|(_, task)| task.handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| tasks.remove(&id)).collect()
        };

        // Awaited outside the lock; every handle here is already finished.
        let count = finished.len();
        for task in finished {
            report(task.kind, task.handle.await);
        }
        count
    }

    /// Wait for every tracked task, up to `grace`. Tasks still running at
    /// the deadline are aborted. Returns the number aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;

        // Tasks may spawn more tasks while we wait, so loop until empty.
        loop {
            let batch: Vec<TrackedTask> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
            if batch.is_empty() {
                break;
            }
            for mut task in batch {
                match tokio::time::timeout_at(deadline, &mut task.handle).await {
                    Ok(result) => report(task.kind, result),
                    Err(_) => {
                        task.handle.abort();
                        crate::metrics::BACKGROUND_TASKS_ACTIVE.dec();
                        aborted += 1;
                    }
                }
            }
        }

        if aborted > 0 {
            tracing::warn!(aborted, "Background tasks aborted at shutdown deadline");
        }
        aborted
    }
}

fn report(kind: &'static str, result: Result<(), tokio::task::JoinError>) {
    crate::metrics::BACKGROUND_TASKS_ACTIVE.dec();
    match result {
        Ok(()) => {
            tracing::trace!(kind, "Background task completed");
        }
        Err(join_err) if join_err.is_panic() => {
            crate::metrics::BACKGROUND_TASKS_PANICKED
                .with_label_values(&[kind])
                .inc();
            tracing::error!(kind, panic = ?join_err, "Background task panicked");
        }
        Err(join_err) if join_err.is_cancelled() => {
            tracing::warn!(kind, "Background task was cancelled");
        }
        Err(e) => {
            tracing::error!(kind, error = ?e, "Background task failed");
        }
    }
}
