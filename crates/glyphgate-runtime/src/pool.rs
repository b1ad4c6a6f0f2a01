//! Bounded inference pool
//!
//! Inference is CPU bound, so each job runs on tokio's blocking threads.
//! A semaphore caps concurrency at the configured worker count; the permit
//! travels into the blocking closure, so a timed-out job keeps its slot
//! until it really finishes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("Inference pool is shut down")]
    Closed,

    #[error("Inference task failed: {0}")]
    Join(String),
}

#[derive(Debug)]
pub struct InferencePool {
    permits: Arc<Semaphore>,
    workers: usize,
    timeout: Option<Duration>,
}

impl InferencePool {
    /// `timeout` of `None` waits indefinitely.
    pub fn new(workers: usize, timeout: Option<Duration>) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            timeout,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined.map_err(|e| PoolError::Join(e.to_string())),
                Err(_) => Err(PoolError::Timeout(limit)),
            },
            None => handle.await.map_err(|e| PoolError::Join(e.to_string())),
        }
    }

    /// Wait for every running job, then refuse new ones.
    pub async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.workers as u32).await {
            all.forget();
        }
        self.permits.close();
    }
}
