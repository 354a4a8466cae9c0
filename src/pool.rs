//! A bounded pool of workers for handling decoded envelopes.
//!
//! Receive loops never run handler logic themselves; they submit it here so one slow handler can
//! not hold up the reads behind it. The pool bounds how many handlers run at once. Recipient code,
//! which is synchronous, runs on tokio's blocking threads while holding a pool permit.

use std::{future::Future, sync::Arc};

use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinHandle},
};

/// Default number of envelopes handled concurrently per portal.
pub const DEFAULT_WORKER_THREADS: usize = 16;

/// A bounded pool of handler workers shared by every connection of a portal.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Creates a pool running at most `size` handlers at once. A size of zero is treated as one.
    pub fn new(size: usize) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Number of workers currently idle.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queues `task` to run once a worker is free.
    pub fn submit<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        })
    }

    /// Runs synchronous, possibly slow, code off the async workers.
    ///
    /// Meant to be called from inside a submitted task, so the blocking work is still accounted
    /// against the pool's bound.
    pub async fn run_blocking<F, T>(f: F) -> Result<T, JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new(DEFAULT_WORKER_THREADS)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_runs_more_than_size_tasks() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn zero_sized_pool_still_makes_progress() {
        assert_eq!(WorkerPool::new(0).idle(), 1);
    }

    #[tokio::test]
    async fn blocking_work_returns_its_value() {
        let value = WorkerPool::run_blocking(|| 40 + 2).await.unwrap();
        assert_eq!(value, 42);
    }
}
