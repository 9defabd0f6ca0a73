//! Serial job queue with cancelable delayed jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a delayed job.
#[derive(Debug, Clone)]
pub(crate) struct ScheduledHandle {
    state: Arc<AtomicU8>,
}

impl ScheduledHandle {
    /// Prevent the job from running. Fails once the job has started.
    pub(crate) fn cancel(&self) -> bool {
        match self.state.compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => current == CANCELLED,
        }
    }

    fn start(&self) -> bool {
        self.state.compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn mark_started(&self) -> bool {
        self.start()
    }
}

/// Runs jobs one at a time, in the order they become due.
#[derive(Clone)]
pub(crate) struct Scheduler {
    handle: Handle,
    tx: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    pub(crate) fn spawn(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job().await;
            }
            debug!("Request scheduler stopped");
        });
        Self { handle: handle.clone(), tx }
    }

    /// Queue a job behind everything already due.
    pub(crate) fn execute(&self, job: Job) -> bool {
        self.tx.send(job).is_ok()
    }

    /// Queue `job` once `delay` has elapsed, unless canceled first.
    pub(crate) fn schedule(&self, delay: Duration, job: Job) -> ScheduledHandle {
        let handle = ScheduledHandle { state: Arc::new(AtomicU8::new(PENDING)) };
        let gate = handle.clone();
        let tx = self.tx.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let guarded: Job = Box::new(move || {
                if gate.start() {
                    job()
                } else {
                    Box::pin(async {})
                }
            });
            let _ = tx.send(guarded);
        });
        handle
    }
}
