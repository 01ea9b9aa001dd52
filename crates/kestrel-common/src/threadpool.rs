//! Bounded worker pool for application-level work.
//!
//! Network tasks never run service methods or user callbacks themselves: they
//! hand them to a [`WorkerPool`] so a slow call cannot stall the connection
//! that delivered it. The pool has a fixed number of workers and a bounded
//! queue; when the queue is full, [`WorkerPool::submit`] fails with
//! [`RpcError::Rejected`] instead of growing without limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::protocol::error::{Result, RpcError};

/// Default task queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 65536;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of jobs that may run at the same time
    pub workers: usize,
    /// Jobs that may wait for a worker before submissions are rejected
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl PoolConfig {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self {
            workers,
            queue_capacity,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.workers == 0 {
            return Err("worker count must be greater than zero".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue capacity must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Fixed-size pool of workers fed by a bounded queue.
///
/// Jobs are plain closures and may block: each runs on tokio's blocking
/// thread pool, and at most `workers` run at once. A panicking job is logged
/// and does not take its worker down.
///
/// # Example
///
/// ```
/// use kestrel_common::threadpool::{PoolConfig, WorkerPool};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = WorkerPool::new("example", PoolConfig::new(2, 16))?;
/// let (tx, rx) = tokio::sync::oneshot::channel();
/// pool.submit(move || {
///     let _ = tx.send(21 * 2);
/// })?;
/// assert_eq!(rx.await?, 42);
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool {
    name: String,
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Starts the pool's workers on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no tokio runtime is
    /// running on this thread.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Result<Self> {
        config.validate().map_err(RpcError::InvalidConfig)?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| RpcError::InvalidConfig(format!("worker pool needs a tokio runtime: {}", e)))?;

        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let workers = (0..config.workers)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let in_flight = in_flight.clone();
                let pool_name = name.clone();
                handle.spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        in_flight.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = tokio::task::spawn_blocking(job).await {
                            tracing::error!(pool = %pool_name, worker_id, "Worker job panicked: {}", e);
                        }
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                    tracing::debug!(pool = %pool_name, worker_id, "Worker stopped");
                })
            })
            .collect();

        tracing::debug!(pool = %name, workers = config.workers, queue_capacity = config.queue_capacity, "Worker pool started");

        Ok(Self {
            name,
            sender,
            workers,
            in_flight,
        })
    }

    /// Queues a job without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Rejected`] if the queue is full or the pool has
    /// been shut down.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.try_send(Box::new(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!(pool = %self.name, "Worker pool queue is full, rejecting job");
                RpcError::Rejected(format!("worker pool '{}' queue is full", self.name))
            }
            mpsc::error::TrySendError::Closed(_) => {
                RpcError::Rejected(format!("worker pool '{}' is shut down", self.name))
            }
        })
    }

    /// Number of jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting work, lets queued jobs finish and waits for the workers.
    pub async fn shutdown(self) {
        let WorkerPool {
            name,
            sender,
            workers,
            ..
        } = self;
        drop(sender);
        for worker in workers {
            let _ = worker.await;
        }
        tracing::debug!(pool = %name, "Worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.workers, 16);
        assert_eq!(config.queue_capacity, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::new(0, 10).validate().is_err());
        assert!(PoolConfig::new(1, 0).validate().is_err());
    }

    #[test]
    fn test_pool_requires_runtime() {
        let result = WorkerPool::new("no-runtime", PoolConfig::default());
        assert!(matches!(result, Err(RpcError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_runs_all_jobs() {
        let pool = WorkerPool::new("test", PoolConfig::new(4, 128)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let pool = WorkerPool::new("tiny", PoolConfig::new(1, 1)).unwrap();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        // Occupy the only worker
        pool.submit(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.await.unwrap();

        // Fill the queue
        pool.submit(|| {}).unwrap();

        let err = pool.submit(|| {}).unwrap_err();
        assert!(matches!(err, RpcError::Rejected(_)));

        release_tx.send(()).unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("panics", PoolConfig::new(1, 8)).unwrap();
        pool.submit(|| panic!("job failure")).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.submit(move || {
            let _ = tx.send(7);
        })
        .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(value, 7);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("bounded", PoolConfig::new(2, 64)).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
