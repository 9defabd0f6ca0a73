//! Per-endpoint batch accumulator.

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::engine::{Dispatch, EngineInner, ResponseCallback};
use super::model::{Request, RequestContext};
use super::scheduler::ScheduledHandle;
use super::{Payload, Response};
use crate::config::{BatchPolicy, RetryPolicy};
use crate::sync::lock;

const ACTION_TYPE: &str = "action_type";
const OBJECT_TYPE: &str = "object_type";
const OBJECT_INSTANCE_ID: &str = "object_instance_id";
const DURATION: &str = "duration";
const COUNT: &str = "count";
const SUM_OF_SQUARES: &str = "sum_of_squares";

/// How payloads combine inside one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchKind {
    /// Keep every payload in append order.
    Append,
    /// Merge payloads describing the same event by summing their counters.
    TrackEvent,
    /// Keep only the latest payload.
    LastWriteWins,
}

/// Result of [`BatchAccumulator::add`].
pub(crate) enum AddOutcome {
    Added,
    /// The payload was not taken. `sent` tells whether the batch already
    /// flushed or only had a flush in progress.
    Rejected { context: RequestContext, payload: Payload, callback: Option<ResponseCallback>, sent: bool },
}

#[derive(Default)]
struct BatchState {
    payloads: Vec<Payload>,
    callbacks: Vec<ResponseCallback>,
    context: Option<RequestContext>,
    first_add: Option<Instant>,
    flush: Option<ScheduledHandle>,
    max_wait: Option<ScheduledHandle>,
    sent: bool,
}

/// Collects payloads for one (hostname, endpoint) and flushes them as a single
/// request.
pub(crate) struct BatchAccumulator {
    hostname: String,
    endpoint: String,
    kind: BatchKind,
    policy: BatchPolicy,
    retry: RetryPolicy,
    engine: Weak<EngineInner>,
    state: Mutex<BatchState>,
}

impl BatchAccumulator {
    pub(crate) fn new(
        hostname: impl Into<String>,
        endpoint: impl Into<String>,
        kind: BatchKind,
        policy: BatchPolicy,
        retry: RetryPolicy,
        engine: Weak<EngineInner>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            endpoint: endpoint.into(),
            kind,
            policy,
            retry,
            engine,
            state: Mutex::new(BatchState::default()),
        }
    }

    pub(crate) fn is_sent(&self) -> bool {
        lock(&self.state).sent
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.state).payloads.len()
    }

    /// Move the pending debounce flush to started, as if its timer had fired.
    #[cfg(test)]
    pub(crate) fn start_pending_flush(&self) -> bool {
        lock(&self.state).flush.as_ref().is_some_and(ScheduledHandle::mark_started)
    }

    /// Add a payload, flushing or (re)scheduling as the policy requires.
    pub(crate) fn add(
        self: &Arc<Self>,
        context: RequestContext,
        payload: Payload,
        callback: Option<ResponseCallback>,
    ) -> AddOutcome {
        let Some(engine) = self.engine.upgrade() else {
            return AddOutcome::Rejected { context, payload, callback, sent: true };
        };

        let mut state = lock(&self.state);
        if state.sent {
            return AddOutcome::Rejected { context, payload, callback, sent: true };
        }
        if let Some(pending) = state.flush.take()
            && !pending.cancel()
        {
            state.flush = Some(pending);
            return AddOutcome::Rejected { context, payload, callback, sent: false };
        }

        self.merge(&mut state.payloads, payload);
        if let Some(callback) = callback {
            state.callbacks.push(callback);
        }
        state.context = Some(context);

        if state.first_add.is_none() {
            state.first_add = Some(Instant::now());
            if let Some(max_wait) = self.policy.max_wait() {
                state.max_wait = Some(engine.scheduler().schedule(max_wait, self.flush_job()));
            }
        }

        if self.policy.threshold_reached(state.payloads.len()) || self.policy.time().is_zero() {
            let dispatch = self.take_locked(&mut state);
            drop(state);
            if let Some(dispatch) = dispatch {
                engine.enqueue(dispatch);
            }
        } else {
            state.flush = Some(engine.scheduler().schedule(self.policy.time(), self.flush_job()));
        }
        AddOutcome::Added
    }

    fn merge(&self, payloads: &mut Vec<Payload>, payload: Payload) {
        match self.kind {
            BatchKind::Append => payloads.push(payload),
            BatchKind::LastWriteWins => {
                payloads.clear();
                payloads.push(payload);
            }
            BatchKind::TrackEvent => {
                if let Some(existing) = payloads.iter_mut().find(|p| same_event(p, &payload)) {
                    for key in [DURATION, COUNT, SUM_OF_SQUARES] {
                        let total = counter(existing, key) + counter(&payload, key);
                        existing.insert(key.to_string(), Value::from(total));
                    }
                } else {
                    payloads.push(payload);
                }
            }
        }
    }

    fn flush_job(self: &Arc<Self>) -> super::scheduler::Job {
        let accumulator = Arc::clone(self);
        Box::new(move || {
            Box::pin(async move {
                let dispatch = accumulator.take();
                if let (Some(dispatch), Some(engine)) = (dispatch, accumulator.engine.upgrade()) {
                    engine.perform(dispatch).await;
                }
            })
        })
    }

    fn take(&self) -> Option<Dispatch> {
        let mut state = lock(&self.state);
        self.take_locked(&mut state)
    }

    /// Mark the batch sent and turn its contents into one request.
    fn take_locked(&self, state: &mut BatchState) -> Option<Dispatch> {
        if state.sent {
            return None;
        }
        state.sent = true;
        for handle in [state.flush.take(), state.max_wait.take()].into_iter().flatten() {
            handle.cancel();
        }

        let context = state.context.take()?;
        let payloads = std::mem::take(&mut state.payloads);
        let callbacks = std::mem::take(&mut state.callbacks);
        debug!(
            hostname = %self.hostname,
            endpoint = %self.endpoint,
            entries = payloads.len(),
            "Flushing batch"
        );

        let body = match self.kind {
            BatchKind::LastWriteWins => payloads.into_iter().next_back().unwrap_or_default(),
            BatchKind::Append | BatchKind::TrackEvent => {
                let mut body = Payload::new();
                body.insert("batch".into(), Value::Array(payloads.into_iter().map(Value::Object).collect()));
                body
            }
        };
        let request = Request::new(&context, self.endpoint.as_str(), body).with_hostname(self.hostname.as_str());

        let callback: Option<ResponseCallback> = if callbacks.is_empty() {
            None
        } else {
            Some(Box::new(move |response: Response| {
                for callback in callbacks {
                    callback(response.clone());
                }
            }))
        };
        Some(Dispatch { request: Arc::new(request), retry: self.retry.clone(), callback })
    }

    /// Wrap a single rejected payload the same way a flush would.
    pub(crate) fn single(&self, context: &RequestContext, payload: Payload) -> Request {
        let body = match self.kind {
            BatchKind::LastWriteWins => payload,
            BatchKind::Append | BatchKind::TrackEvent => {
                let mut body = Payload::new();
                body.insert("batch".into(), Value::Array(vec![Value::Object(payload)]));
                body
            }
        };
        Request::new(context, self.endpoint.as_str(), body).with_hostname(self.hostname.as_str())
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

fn same_event(a: &Payload, b: &Payload) -> bool {
    [ACTION_TYPE, OBJECT_TYPE, OBJECT_INSTANCE_ID].iter().all(|key| a.get(*key) == b.get(*key))
}

fn counter(payload: &Payload, key: &str) -> u64 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Payload for one occurrence of a tracked event.
pub(crate) fn track_event_payload(
    action_type: &str,
    object_type: Option<&str>,
    object_instance_id: Option<&str>,
    duration: u64,
) -> Payload {
    let mut payload = Payload::new();
    payload.insert(ACTION_TYPE.into(), Value::from(action_type));
    if let Some(object_type) = object_type.filter(|s| !s.trim().is_empty()) {
        payload.insert(OBJECT_TYPE.into(), Value::from(object_type));
    }
    if let Some(instance) = object_instance_id.filter(|s| !s.trim().is_empty()) {
        payload.insert(OBJECT_INSTANCE_ID.into(), Value::from(instance));
    }
    payload.insert(DURATION.into(), Value::from(duration));
    payload.insert(COUNT.into(), Value::from(1_u64));
    payload.insert(SUM_OF_SQUARES.into(), Value::from(duration.saturating_mul(duration)));
    payload
}
