//! Request engine: policy lookup, batching, signing, transmission and retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::batch::{AddOutcome, BatchAccumulator, BatchKind, track_event_payload};
use super::model::{Request, RequestContext};
use super::scheduler::Scheduler;
use super::signing;
use super::transport::{HttpTransport, Response, TransportError};
use super::Payload;
use crate::config::{EndpointPolicy, RemoteConfiguration, RetryPolicy, TransportConfig};
use crate::sync::lock;

/// Endpoint receiving tracked events.
pub const TRACK_EVENT_ENDPOINT: &str = "/me/events";

/// Invoked exactly once with the final response of a request.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;

/// A request on its way through the scheduler.
pub(crate) struct Dispatch {
    pub(crate) request: Arc<Request>,
    pub(crate) retry: RetryPolicy,
    pub(crate) callback: Option<ResponseCallback>,
}

type BatchKey = (String, String);

pub(crate) struct EngineInner {
    transport: Arc<dyn HttpTransport>,
    scheduler: Scheduler,
    scheme: String,
    signature_header: String,
    remote: Mutex<Option<Arc<RemoteConfiguration>>>,
    batches: Mutex<HashMap<BatchKey, Arc<BatchAccumulator>>>,
}

/// Sends signed requests in submission order, batching and retrying them per
/// endpoint policy.
#[derive(Clone)]
pub struct RequestEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RequestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEngine").field("scheme", &self.inner.scheme).finish_non_exhaustive()
    }
}

impl RequestEngine {
    /// Create an engine whose scheduling task runs on `handle`.
    pub fn new(handle: &Handle, transport: Arc<dyn HttpTransport>, config: &TransportConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport,
                scheduler: Scheduler::spawn(handle),
                scheme: config.scheme.clone(),
                signature_header: config.signature_header.clone(),
                remote: Mutex::new(None),
                batches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Replace the remote configuration used for policy lookups.
    pub fn set_remote_configuration(&self, remote: Arc<RemoteConfiguration>) {
        info!(hostname = %remote.hostname, "Request engine configured");
        *lock(&self.inner.remote) = Some(remote);
    }

    /// Current remote configuration, if any.
    pub fn remote_configuration(&self) -> Option<Arc<RemoteConfiguration>> {
        lock(&self.inner.remote).clone()
    }

    /// Transport used by this engine.
    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.inner.transport)
    }

    /// Build a request for `endpoint` and send it according to its policy.
    ///
    /// Batched endpoints go through their accumulator. Blackholed endpoints
    /// are dropped and `callback` is never invoked.
    pub fn submit(
        &self,
        context: &RequestContext,
        endpoint: &str,
        payload: Payload,
        callback: Option<ResponseCallback>,
    ) {
        let hostname = context.hostname().to_string();
        let policy = self.inner.policy_for(context, &hostname, endpoint);
        if policy.blackhole {
            debug!(hostname = %hostname, endpoint = %endpoint, "Dropping blackholed request");
            return;
        }

        if policy.batch.is_batching() {
            let kind = if policy.batch.last_write_wins() { BatchKind::LastWriteWins } else { BatchKind::Append };
            self.submit_batched(context, (hostname, endpoint.to_string()), kind, &policy, payload, callback);
        } else {
            let request = Request::new(context, endpoint, payload);
            self.inner.enqueue(Dispatch { request: Arc::new(request), retry: policy.retry, callback });
        }
    }

    /// Sign and send `request` right away, outside the queue and without
    /// retries.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the exchange did not complete.
    pub async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        self.inner.transmit(request).await
    }

    /// Send an already built request. It is never batched.
    pub fn submit_request(&self, request: Request, callback: Option<ResponseCallback>) {
        let policy = self.inner.policy_lookup(None, request.hostname(), request.endpoint());
        if policy.blackhole {
            debug!(request_id = %request.request_id(), endpoint = %request.endpoint(), "Dropping blackholed request");
            return;
        }
        self.inner.enqueue(Dispatch { request: Arc::new(request), retry: policy.retry, callback });
    }

    /// Record one occurrence of an event. Occurrences of the same
    /// (action, object type, instance) inside one batch are merged.
    pub fn track_event(
        &self,
        context: &RequestContext,
        action_type: &str,
        object_type: Option<&str>,
        object_instance_id: Option<&str>,
        duration: u64,
    ) {
        let hostname = context.hostname().to_string();
        let policy = self.inner.policy_for(context, &hostname, TRACK_EVENT_ENDPOINT);
        if policy.blackhole {
            debug!(action_type = %action_type, "Dropping blackholed event");
            return;
        }
        let payload = track_event_payload(action_type, object_type, object_instance_id, duration);
        self.submit_batched(
            context,
            (hostname, TRACK_EVENT_ENDPOINT.to_string()),
            BatchKind::TrackEvent,
            &policy,
            payload,
            None,
        );
    }

    fn submit_batched(
        &self,
        context: &RequestContext,
        key: BatchKey,
        kind: BatchKind,
        policy: &EndpointPolicy,
        payload: Payload,
        callback: Option<ResponseCallback>,
    ) {
        let accumulator = self.inner.accumulator(&key, kind, policy, false);
        let AddOutcome::Rejected { context, payload, callback, sent } =
            accumulator.add(context.clone(), payload, callback)
        else {
            return;
        };

        if sent {
            let fresh = self.inner.accumulator(&key, kind, policy, true);
            if let AddOutcome::Rejected { context, payload, callback, .. } = fresh.add(context, payload, callback) {
                self.run_separately(&fresh, &context, payload, callback);
            }
        } else {
            debug!(hostname = %key.0, endpoint = %key.1, "Flush in progress, sending separately");
            self.run_separately(&accumulator, &context, payload, callback);
        }
    }

    fn run_separately(
        &self,
        accumulator: &BatchAccumulator,
        context: &RequestContext,
        payload: Payload,
        callback: Option<ResponseCallback>,
    ) {
        let request = accumulator.single(context, payload);
        self.inner.enqueue(Dispatch {
            request: Arc::new(request),
            retry: accumulator.retry_policy().clone(),
            callback,
        });
    }
}

impl EngineInner {
    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn policy_for(&self, context: &RequestContext, hostname: &str, endpoint: &str) -> EndpointPolicy {
        self.policy_lookup(context.remote.as_ref(), hostname, endpoint)
    }

    fn policy_lookup(
        &self,
        fallback: Option<&Arc<RemoteConfiguration>>,
        hostname: &str,
        endpoint: &str,
    ) -> EndpointPolicy {
        let current = lock(&self.remote).clone();
        current
            .as_ref()
            .or(fallback)
            .map(|remote| remote.policy_for(hostname, endpoint))
            .unwrap_or_default()
    }

    fn accumulator(
        self: &Arc<Self>,
        key: &BatchKey,
        kind: BatchKind,
        policy: &EndpointPolicy,
        replace: bool,
    ) -> Arc<BatchAccumulator> {
        let mut batches = lock(&self.batches);
        if !replace
            && let Some(existing) = batches.get(key)
            && !existing.is_sent()
        {
            return Arc::clone(existing);
        }
        let fresh = Arc::new(BatchAccumulator::new(
            key.0.as_str(),
            key.1.as_str(),
            kind,
            policy.batch.clone(),
            policy.retry.clone(),
            Arc::downgrade(self),
        ));
        batches.insert(key.clone(), Arc::clone(&fresh));
        fresh
    }

    pub(crate) fn enqueue(self: &Arc<Self>, dispatch: Dispatch) {
        let inner = Arc::clone(self);
        let queued = self.scheduler.execute(Box::new(move || inner.perform(dispatch)));
        if !queued {
            warn!("Request scheduler is gone, dropping request");
        }
    }

    async fn transmit(&self, request: &Request) -> Result<Response, TransportError> {
        let body = request.body();
        let signature =
            signing::sign(request.method(), request.hostname(), request.endpoint(), &body, request.secret())?;
        let headers = [(self.signature_header.clone(), signing::authorization_value(&signature))];
        let url = request.url(&self.scheme);

        request.mark_sent();
        debug!(request_id = %request.request_id(), url = %url, "Sending request");
        self.transport.post(&url, body, &headers).await
    }

    /// Sign, transmit, then either schedule a retry or complete the request.
    pub(crate) fn perform(self: Arc<Self>, dispatch: Dispatch) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let request = Arc::clone(&dispatch.request);
            let response = match self.transmit(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        request_id = %request.request_id(),
                        endpoint = %request.endpoint(),
                        error = %e,
                        "Request failed, dropping"
                    );
                    return;
                }
            };

            if response.is_retryable() {
                let index = request.retry_index();
                if let Some(delay) = dispatch.retry.delay_for(index) {
                    request.advance_retry();
                    warn!(
                        request_id = %request.request_id(),
                        endpoint = %request.endpoint(),
                        status = response.status,
                        attempt = index + 1,
                        delay_secs = delay.as_secs_f64(),
                        "Server error, retrying"
                    );
                    let inner = Arc::clone(&self);
                    self.scheduler.schedule(delay, Box::new(move || inner.perform(dispatch)));
                    return;
                }
            }

            debug!(
                request_id = %request.request_id(),
                endpoint = %request.endpoint(),
                status = response.status,
                "Request complete"
            );
            if let Some(callback) = dispatch.callback {
                callback(response);
            }
        })
    }
}
