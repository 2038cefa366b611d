//! Task spawning abstraction for single-threaded execution.

use std::future::Future;

/// Provider for spawning local tasks in a single-threaded context.
///
/// All background work in the client (connection tasks, callback workers,
/// the timeout reaper) is spawned through this trait. Tasks run on the
/// current thread via `spawn_local`, which keeps shared state `Rc`-based and
/// lock-free.
pub trait TaskProvider: Clone {
    /// Spawn a named task that runs on the current thread.
    ///
    /// The name is attached to trace events only; it carries no runtime
    /// semantics.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// Tokio-based task provider using `spawn_local`.
///
/// Must be used from within a `tokio::task::LocalSet` (or a current-thread
/// runtime that supports local tasks); spawning outside one panics at
/// runtime, which is a programming error, not an operational condition.
#[derive(Clone, Debug, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!(task = %task_name, "task starting");
            future.await;
            tracing::trace!(task = %task_name, "task completed");
        })
    }
}
