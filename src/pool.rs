//! Bounded worker pool for setup runs.
//!
//! Every setup or shutdown sequence runs as a tokio task, but at most
//! `max_workers` of them execute at once; the rest wait on a semaphore in
//! launch order. The pool is shared by every device in the machine so a
//! machine-wide start cannot saturate the driver layer.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Shared, bounded executor for setup runs.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    max_workers: usize,
}

/// Decrements the active counter when a run ends, including by unwinding.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// Create a pool that runs at most `max_workers` sequences concurrently.
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            active: Arc::new(AtomicUsize::new(0)),
            max_workers,
        }
    }

    /// Concurrency limit.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of runs currently executing (not counting queued ones).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop admitting work. Queued runs that have not started are dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Queue `work` for execution.
    ///
    /// The returned handle resolves to `Some(output)` once the work has run,
    /// or `None` if the pool was closed before a slot freed up; in that case
    /// `work` is dropped without being polled. A panic inside `work`
    /// propagates to the handle as a `JoinError`.
    pub fn spawn<F>(&self, label: impl Into<String>, work: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let label = label.into();
        let semaphore = Arc::clone(&self.semaphore);
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            // Held for the lifetime of the run
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(task = %label, "worker pool closed, run dropped");
                    return None;
                }
            };
            active.fetch_add(1, Ordering::SeqCst);
            let _guard = ActiveGuard(active);
            tracing::debug!(task = %label, "worker started");
            let output = work.await;
            tracing::debug!(task = %label, "worker finished");
            Some(output)
        })
    }
}
