//! Concurrency helpers shared by the bus, the session manager and the engine.
//!
//! [`SerialExecutor`] runs tasks one after another, in submission order, each
//! on tokio's blocking pool so that slow callbacks never stall async workers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Serial executor backed by one spawned task.
///
/// Clones share the same queue. The worker exits once every clone is dropped.
#[derive(Clone)]
pub(crate) struct SerialExecutor {
    name: &'static str,
    tx: mpsc::UnboundedSender<Task>,
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor").field("name", &self.name).finish_non_exhaustive()
    }
}

impl SerialExecutor {
    /// Spawn the worker on `handle`.
    pub(crate) fn spawn(handle: &Handle, name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let worker_handle = handle.clone();
        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                if let Err(e) = worker_handle.spawn_blocking(task).await {
                    error!(executor = name, error = %e, "Serial task panicked");
                }
            }
            debug!(executor = name, "Serial executor stopped");
        });
        Self { name, tx }
    }

    /// Queue a task. Returns false if the worker is gone.
    pub(crate) fn execute(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tasks_run_in_order() {
        let executor = SerialExecutor::spawn(&Handle::current(), "test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let seen = Arc::clone(&seen);
            executor.execute(move || {
                // Uneven work per task must not reorder completion.
                std::thread::sleep(std::time::Duration::from_millis((20 - i) % 3));
                seen.lock().unwrap().push(i);
            });
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_does_not_stop_worker() {
        let executor = SerialExecutor::spawn(&Handle::current(), "test");
        executor.execute(|| panic!("boom"));

        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }
}
