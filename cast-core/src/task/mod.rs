//! Bounded worker pool for short-lived network probes.
//!
//! A segment scan queues one job per host address. At most `workers` of
//! them run at the same time; the rest wait for a permit. Every job is
//! tied to the pool's [`CancellationToken`], so stopping discovery drops
//! queued and in-flight probes together.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sync::lock;

/// Default number of concurrent probe workers.
pub const DEFAULT_WORKERS: usize = 50;

pub struct ProbePool {
    permits: Arc<Semaphore>,
    workers: usize,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl ProbePool {
    /// Creates a pool running at most `workers` jobs at once.
    ///
    /// # Arguments
    ///
    /// * `workers` - The concurrency cap. Zero is raised to one.
    /// * `cancel` - Token that aborts every queued and running job when cancelled.
    pub fn new(workers: usize, cancel: CancellationToken) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            cancel,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Queues `job`. It starts once a worker permit is free, unless the pool
    /// is cancelled first. Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }

        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = job => {}
            }
        });
    }

    /// Number of jobs queued or running.
    pub fn pending(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits until every queued job has finished.
    pub async fn wait_idle(&self) {
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        while tasks.join_next().await.is_some() {}
    }

    /// Cancels every queued and running job without waiting for them.
    /// The pool accepts no further work afterwards.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
        lock(&self.tasks).abort_all();
    }

    /// [`cancel_all`](Self::cancel_all), then waits for the jobs to unwind.
    pub async fn shutdown(&self) {
        self.cancel_all();
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        let dropped = tasks.len();
        while tasks.join_next().await.is_some() {}
        debug!(dropped, "probe pool shut down");
    }
}

// ── Tests ────────────────────────────────────────────────────────
