//! Ordered callback executor.
//!
//! User callbacks never run on the I/O tasks. They are posted here, keyed by
//! ledger id: tasks sharing a key land on the same worker and run in
//! submission order, tasks with different keys may interleave. Workers are
//! plain local tasks draining unbounded FIFO queues.

use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;

use tidepool_core::TaskProvider;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A unit of callback work.
pub type Job = Box<dyn FnOnce()>;

/// Error returned when submitting to a shut-down executor.
#[derive(Debug, Clone, thiserror::Error)]
#[error("ordered executor is shut down")]
pub struct ExecutorClosed;

/// Worker pool with per-key FIFO ordering.
pub struct OrderedExecutor {
    workers: RefCell<Vec<mpsc::UnboundedSender<Job>>>,
    handles: RefCell<Vec<JoinHandle<()>>>,
    shutdown: Cell<bool>,
}

impl OrderedExecutor {
    /// Create an executor with the given number of workers (at least one).
    ///
    /// Workers are spawned immediately, so this must be called from within
    /// the runtime context.
    pub fn new<T: TaskProvider>(tasks: &T, workers: usize) -> Self {
        let count = workers.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let handle = tasks.spawn_task(&format!("ordered-worker-{index}"), async move {
                while let Some(job) = rx.recv().await {
                    if std::panic::catch_unwind(AssertUnwindSafe(|| job())).is_err() {
                        tracing::error!(worker = index, "callback panicked, containing");
                    }
                }
            });
            senders.push(tx);
            handles.push(handle);
        }

        Self {
            workers: RefCell::new(senders),
            handles: RefCell::new(handles),
            shutdown: Cell::new(false),
        }
    }

    /// Submit a task; tasks with the same key execute serially in
    /// submission order.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorClosed`] after [`shutdown`](Self::shutdown) has
    /// been initiated.
    pub fn submit_ordered(&self, key: u64, job: Job) -> Result<(), ExecutorClosed> {
        if self.shutdown.get() {
            return Err(ExecutorClosed);
        }
        let workers = self.workers.borrow();
        let index = Self::worker_index(key, workers.len());
        workers[index].send(job).map_err(|_| ExecutorClosed)
    }

    /// Whether the executor has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.get()
    }

    /// Shut down: reject new submissions, then wait for every worker to
    /// drain its queue. All previously submitted tasks run before this
    /// returns.
    pub async fn shutdown(&self) {
        if self.shutdown.replace(true) {
            return;
        }
        self.workers.borrow_mut().clear();
        let handles: Vec<JoinHandle<()>> = self.handles.borrow_mut().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn worker_index(key: u64, count: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % count as u64) as usize
    }
}
