//! Ordered, asynchronous event bus.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::types::{EventListener, ListenerId, TeakEvent};
use crate::sync::{SerialExecutor, lock};

type ListenerList = Arc<Vec<(ListenerId, Arc<dyn EventListener>)>>;

enum BusMessage {
    Event(TeakEvent),
    Barrier(oneshot::Sender<()>),
    Stop,
}

struct Worker {
    tx: mpsc::UnboundedSender<BusMessage>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct WorkerSlot {
    active: Option<Worker>,
    // Stopped worker that may still be draining; its successor waits for it.
    stopping: Option<JoinHandle<()>>,
}

/// Copy-on-write listener set. Writers swap the whole list so the worker can
/// snapshot it without holding the lock during dispatch.
#[derive(Default)]
struct ListenerSet {
    current: Mutex<ListenerList>,
}

impl ListenerSet {
    fn snapshot(&self) -> ListenerList {
        Arc::clone(&lock(&self.current))
    }
}

struct BusInner {
    handle: Handle,
    listeners: Arc<ListenerSet>,
    next_id: AtomicU64,
    worker: Mutex<WorkerSlot>,
    dispatcher: SerialExecutor,
}

/// Delivers [`TeakEvent`]s to every registered listener in post order.
///
/// A single worker task drains the queue. It starts on the first post, and
/// a later post starts a new one if the previous worker stopped or died.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus whose tasks run on `handle`.
    pub fn new(handle: &Handle) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handle: handle.clone(),
                listeners: Arc::new(ListenerSet::default()),
                next_id: AtomicU64::new(1),
                worker: Mutex::new(WorkerSlot::default()),
                dispatcher: SerialExecutor::spawn(handle, "event-dispatch"),
            }),
        }
    }

    /// Register a listener. It receives every event posted after this call
    /// returns.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut current = lock(&self.inner.listeners.current);
        let mut next: Vec<_> = current.iter().cloned().collect();
        next.push((id, listener));
        *current = Arc::new(next);
        id
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut current = lock(&self.inner.listeners.current);
        if !current.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<_> = current.iter().filter(|(existing, _)| *existing != id).cloned().collect();
        *current = Arc::new(next);
        true
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.snapshot().len()
    }

    /// Queue an event for delivery.
    pub fn post(&self, event: TeakEvent) {
        debug!(event = event.kind(), "Posting event");
        self.send(BusMessage::Event(event));
    }

    /// Wait until every event posted before this call has been dispatched to
    /// all listeners.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(BusMessage::Barrier(tx));
        let _ = rx.await;
    }

    /// Stop the worker after it drains the events already queued.
    pub fn shutdown(&self) {
        let mut slot = lock(&self.inner.worker);
        if let Some(worker) = slot.active.take() {
            let _ = worker.tx.send(BusMessage::Stop);
            slot.stopping = Some(worker.task);
            info!("Event bus stopping");
        }
    }

    fn send(&self, message: BusMessage) {
        let mut slot = lock(&self.inner.worker);
        let message = match slot.active.as_ref() {
            Some(worker) if !worker.task.is_finished() => match worker.tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            _ => message,
        };

        let previous = slot.stopping.take();
        let worker = self.start_worker(previous);
        // The new receiver is alive until the send below has been queued.
        let _ = worker.tx.send(message);
        slot.active = Some(worker);
    }

    fn start_worker(&self, previous: Option<JoinHandle<()>>) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listeners = Arc::clone(&self.inner.listeners);
        let dispatcher = self.inner.dispatcher.clone();
        let task = self.inner.handle.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            debug!("Event bus worker started");
            while let Some(message) = rx.recv().await {
                match message {
                    BusMessage::Event(event) => {
                        let snapshot = listeners.snapshot();
                        dispatcher.execute(move || dispatch(&snapshot, &event));
                    }
                    BusMessage::Barrier(done) => {
                        dispatcher.execute(move || {
                            let _ = done.send(());
                        });
                    }
                    BusMessage::Stop => break,
                }
            }
            debug!("Event bus worker stopped");
        });
        Worker { tx, task }
    }
}

fn dispatch(listeners: &ListenerList, event: &TeakEvent) {
    for (id, listener) in listeners.iter() {
        if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
            error!(listener = id.0, event = event.kind(), "Event listener panicked");
        }
    }
}
