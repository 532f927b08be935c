//! Bounded worker pool that takes request processing off the I/O path.
//!
//! Jobs go into a bounded tokio mpsc queue drained by a fixed number of
//! worker tasks. A full queue rejects immediately instead of applying
//! backpressure to the caller. Shutdown stops intake, lets the workers drain
//! what is already queued, then joins them.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::PoolError;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PoolState {
    active: AtomicUsize,
    queued: AtomicUsize,
    task_count: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
    shutdown: AtomicBool,
    terminated: AtomicBool,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub active: usize,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub task_count: u64,
    pub completed: u64,
    pub rejected: u64,
    pub panicked: u64,
    pub shutdown: bool,
    pub terminating: bool,
    pub terminated: bool,
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<PoolState>,
    worker_count: usize,
    queue_capacity: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `workers` tasks over a queue of `queue_capacity` jobs. Both are
    /// raised to at least 1.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let worker_count = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let state = Arc::new(PoolState::default());

        let handles = (0..worker_count)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        state.queued.fetch_sub(1, Ordering::SeqCst);
                        state.active.fetch_add(1, Ordering::SeqCst);
                        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            state.panicked.fetch_add(1, Ordering::Relaxed);
                            error!(worker, "worker job panicked");
                        }
                        state.active.fetch_sub(1, Ordering::SeqCst);
                        state.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    debug!(worker, "worker exited");
                })
            })
            .collect();

        info!(workers = worker_count, queue_capacity, "worker pool started");
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            state,
            worker_count,
            queue_capacity,
        }
    }

    /// Queue a job without waiting.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_ref() else {
            return Err(PoolError::ShutDown);
        };
        self.state.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(Box::new(job)) {
            Ok(()) => {
                self.state.task_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.state.queued.fetch_sub(1, Ordering::SeqCst);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        self.state.rejected.fetch_add(1, Ordering::Relaxed);
                        Err(PoolError::QueueFull)
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(PoolError::ShutDown),
                }
            }
        }
    }

    /// Stop intake, drain queued jobs, join workers. Idempotent.
    pub async fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
        if !self.state.terminated.swap(true, Ordering::SeqCst) {
            info!(completed = self.completed_count(), "worker pool terminated");
        }
    }

    /// Jobs currently executing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the queue.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.state.queued.load(Ordering::SeqCst)
    }

    /// Jobs ever accepted.
    #[must_use]
    pub fn task_count(&self) -> u64 {
        self.state.task_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.state.completed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    /// Shut down but still draining.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.is_shutdown() && !self.is_terminated()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.worker_count,
            active: self.active_count(),
            queue_size: self.queue_size(),
            queue_capacity: self.queue_capacity,
            task_count: self.task_count(),
            completed: self.completed_count(),
            rejected: self.state.rejected.load(Ordering::Relaxed),
            panicked: self.state.panicked.load(Ordering::Relaxed),
            shutdown: self.is_shutdown(),
            terminating: self.is_terminating(),
            terminated: self.is_terminated(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_jobs_and_drains_on_shutdown() {
        let pool = WorkerPool::new(2, 64);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 20);
        let stats = pool.stats();
        assert_eq!(stats.task_count, 20);
        assert_eq!(stats.completed, 20);
        assert_eq!(stats.queue_size, 0);
        assert!(stats.terminated && !stats.terminating);
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new(1, 4);
        pool.shutdown().await;
        assert_eq!(pool.submit(|| {}), Err(PoolError::ShutDown));
        assert!(pool.is_shutdown());
        // Second shutdown is a no-op.
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_rejects() {
        let pool = WorkerPool::new(1, 1);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        pool.submit(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.active_count(), 1);

        pool.submit(|| {}).unwrap();
        assert_eq!(pool.queue_size(), 1);
        assert_eq!(pool.submit(|| {}), Err(PoolError::QueueFull));
        assert_eq!(pool.stats().rejected, 1);

        release_tx.send(()).unwrap();
        pool.shutdown().await;
        assert_eq!(pool.completed_count(), 2);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, 8);
        pool.submit(|| panic!("boom")).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        pool.submit(move || flag.store(true, Ordering::SeqCst)).unwrap();
        pool.shutdown().await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(pool.stats().panicked, 1);
    }
}
