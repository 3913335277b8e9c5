//! # Offload Worker Pool
//!
//! A bounded pool for routes that explicitly hand work off the I/O
//! carrier (spec §5: "Long-running routes MUST offload; otherwise they
//! starve their I/O carrier"). Sized `core = CPU count, max = 2×CPU`,
//! bounded queue ≈1000, caller-runs rejection policy: when the queue is
//! full the submitting task just runs the work itself instead of
//! blocking or dropping it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

const DEFAULT_QUEUE_DEPTH: usize = 1000;

/// Fixed-size async worker pool with a bounded task queue.
pub struct WorkerPool {
    sender: mpsc::Sender<BoxedTask>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// `workers` caps concurrently-running tasks (spec: `max = 2×CPU`);
    /// the queue additionally bounds how much work can be buffered ahead
    /// of those workers.
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<BoxedTask>(queue_depth.max(1));
        let permits = Arc::new(Semaphore::new(workers.max(1)));

        let worker_permits = Arc::clone(&permits);
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                let permit = Arc::clone(&worker_permits).acquire_owned().await;
                tokio::spawn(async move {
                    let _permit = permit;
                    task.await;
                });
            }
        });

        Self { sender, permits }
    }

    /// Default sizing from spec §5: core = CPU count, max = 2×CPU, queue
    /// ≈1000.
    pub fn with_default_sizing() -> Self {
        let cpus = num_cpus::get().max(1);
        Self::new(cpus * 2, DEFAULT_QUEUE_DEPTH)
    }

    /// Submit a task. If the bounded queue is full, runs the task on the
    /// caller's own task immediately instead of blocking the producer —
    /// the spec's caller-runs rejection policy.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.sender.try_send(Box::pin(task)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!("worker pool queue saturated, running task on caller");
                task.await;
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!("worker pool shut down, running task on caller");
                task.await;
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn submitted_tasks_run() {
        let pool = WorkerPool::new(2, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    // Runs on the default (current-thread) `#[tokio::test]` runtime, where
    // a task only yields control at an actual await-on-Pending point.
    // `submit`'s happy path (`try_send` succeeds) never hits one, so the
    // background drain task gets no chance to run between these two
    // submissions — the second `try_send` deterministically observes the
    // first item still sitting in the depth-1 queue and falls back to
    // running inline.
    #[tokio::test]
    async fn full_queue_runs_caller_runs_policy() {
        let pool = WorkerPool::new(1, 1);
        let ran_inline = Arc::new(AtomicUsize::new(0));

        pool.submit(async { std::future::pending::<()>().await }).await;

        let flag = Arc::clone(&ran_inline);
        pool.submit(async move {
            flag.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(ran_inline.load(Ordering::SeqCst), 1);
    }
}
