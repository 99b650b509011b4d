//! Worker pool for per-connection callbacks.
//!
//! Every job is keyed by a connection id and routed to one fixed worker, so
//! jobs for the same connection run one at a time in submission order while
//! different connections proceed in parallel on other workers.

use crate::connection::ConnectionId;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Default number of workers.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Worker pool errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The pool no longer accepts jobs.
    #[error("Worker pool is shut down")]
    ShutDown,

    /// The job ended without producing a result (it panicked or was dropped).
    #[error("Job was cancelled")]
    Cancelled,
}

enum Task {
    Run(BoxFuture<'static, ()>),
    Stop,
}

struct PoolInner {
    queues: Vec<mpsc::UnboundedSender<Task>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A fixed pool of tokio worker tasks with per-connection affinity.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn a pool with `size` workers (at least one).
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut queues = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(index, rx)));
        }

        info!(workers = size, "Worker pool started");

        Self {
            inner: Arc::new(PoolInner {
                queues,
                handles: Mutex::new(handles),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.queues.len()
    }

    /// Check whether the pool still accepts jobs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Queue a job without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::ShutDown`] if the pool has been shut down.
    pub fn submit<F>(&self, key: &ConnectionId, job: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_running() {
            return Err(WorkerError::ShutDown);
        }

        let queue = &self.inner.queues[self.shard(key)];
        queue
            .send(Task::Run(job.boxed()))
            .map_err(|_| WorkerError::ShutDown)
    }

    /// Queue a job and wait for its result.
    ///
    /// Must not be awaited from a job running for the same connection, since
    /// that worker is busy running the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is shut down or the job panicked.
    pub async fn run<F, T>(&self, key: &ConnectionId, job: F) -> Result<T, WorkerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(key, async move {
            let _ = tx.send(job.await);
        })?;
        rx.await.map_err(|_| WorkerError::Cancelled)
    }

    /// Stop accepting jobs, let queued jobs finish, and wait for the workers.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for queue in &self.inner.queues {
            let _ = queue.send(Task::Stop);
        }

        let handles = match self.inner.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }

        info!("Worker pool stopped");
    }

    fn shard(&self, key: &ConnectionId) -> usize {
        (key.as_u64() % self.inner.queues.len() as u64) as usize
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_worker(index: usize, mut rx: mpsc::UnboundedReceiver<Task>) {
    while let Some(task) = rx.recv().await {
        match task {
            Task::Run(job) => {
                if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                    error!(
                        worker = index,
                        panic = %panic_message(panic.as_ref()),
                        "Job panicked"
                    );
                }
            }
            Task::Stop => break,
        }
    }
    debug!(worker = index, "Worker exited");
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_in_order() {
        let pool = WorkerPool::new(4);
        let key = ConnectionId::next();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let seen = Arc::clone(&seen);
            pool.submit(&key, async move {
                if i % 3 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                seen.lock().unwrap().push(i);
            })
            .unwrap();
        }

        pool.run(&key, async {}).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_same_key_never_overlaps() {
        let pool = WorkerPool::new(2);
        let key = ConnectionId::next();
        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        for _ in 0..10 {
            let busy = Arc::clone(&busy);
            let overlapped = Arc::clone(&overlapped);
            pool.submit(&key, async move {
                if busy.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::task::yield_now().await;
                busy.store(false, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.run(&key, async {}).await.unwrap();
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = WorkerPool::new(1);
        let key = ConnectionId::next();
        assert_eq!(pool.run(&key, async { 21 * 2 }).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let pool = WorkerPool::new(1);
        let key = ConnectionId::next();

        let result = pool
            .run(&key, async {
                panic!("boom");
            })
            .await;
        assert!(matches!(result, Err(WorkerError::Cancelled)));

        assert_eq!(pool.run(&key, async { "still alive" }).await.unwrap(), "still alive");
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let pool = WorkerPool::new(2);
        let key = ConnectionId::next();
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        pool.submit(&key, async move {
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.shutdown().await;

        assert!(done.load(Ordering::SeqCst));
        assert!(!pool.is_running());
        assert!(matches!(
            pool.submit(&key, async {}),
            Err(WorkerError::ShutDown)
        ));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
