//! Bounded pool of blocking workers.
//!
//! Sandboxed scripts and host calls block, so they never run on the async
//! executor. The pool admits at most `max_workers` jobs at a time; the
//! admission permit travels into the blocking closure, which means a job
//! whose caller gave up (timeout, cancellation) keeps its slot until it has
//! really finished.

use crate::error::CoreError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Pool statistics for observability.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Jobs that ran to completion (successfully or not).
    pub completed: AtomicU64,
    /// Jobs that panicked.
    pub panicked: AtomicU64,
}

impl PoolStats {
    /// Get the number of completed jobs.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Get the number of panicked jobs.
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

/// A semaphore-bounded front for `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Create a pool running at most `size` jobs concurrently.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        tracing::debug!(size, "Creating worker pool");
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Configured number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of idle worker slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pool statistics.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Run `job` on a blocking worker once a slot is free.
    ///
    /// Dropping the returned future abandons the job; it keeps running and
    /// holds its slot until it returns.
    pub async fn run<F, R>(&self, job: F) -> Result<R, CoreError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Worker("worker pool closed".into()))?;

        let stats = Arc::clone(&self.stats);
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let out = job();
            stats.completed.fetch_add(1, Ordering::Relaxed);
            out
        });

        handle.await.map_err(|e| {
            tracing::error!(error = %e, "Blocking worker failed");
            if e.is_panic() {
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
            }
            CoreError::Worker(e.to_string())
        })
    }
}
