//! Session manager: owns the current session and drives its transitions.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::identify::identify_payload;
use super::instance::{Applied, Session};
use super::state::{Attribution, SessionState, StateTransitionError};
use crate::config::{AppIdentity, DeviceIdentity, RemoteConfiguration, SessionConfig};
use crate::events::{EventBus, LifecycleEvent, ListenerId, TeakEvent};
use crate::request::{Payload, RequestContext, Response, ResponseCallback};
use crate::sync::{SerialExecutor, lock};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Callback waiting for an identified user.
pub type ReadyCallback = Box<dyn FnOnce(Arc<Session>) + Send>;

/// Network calls a session makes.
pub trait SessionTransport: Send + Sync {
    /// Send the identify-user call. `done` must be invoked once with the
    /// final response, or never if the request is dropped.
    fn identify_user(&self, context: RequestContext, payload: Payload, done: ResponseCallback);

    /// Send one heartbeat for an identified user.
    fn heartbeat(&self, context: RequestContext);
}

#[derive(Default)]
struct ReadyQueue {
    // Id of the session whose UserIdentified entry last drained the queue.
    drained_for: Option<String>,
    pending: Vec<ReadyCallback>,
}

struct ManagerInner {
    handle: Handle,
    bus: EventBus,
    transport: Arc<dyn SessionTransport>,
    executor: SerialExecutor,
    app: AppIdentity,
    device: Mutex<DeviceIdentity>,
    remote: Mutex<Option<Arc<RemoteConfiguration>>>,
    grace_window: Duration,
    default_heartbeat: Duration,
    current: Mutex<Option<Arc<Session>>>,
    ready: Mutex<ReadyQueue>,
    listener: Mutex<Option<ListenerId>>,
}

/// Owns the single current [`Session`].
///
/// Operations that change which session is current hold the pointer lock for
/// their whole duration. Transition side effects never take that lock, so
/// they are safe to run from inside an operation.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("current", &self.current_session().map(|s| s.id().to_string()))
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with no current session.
    pub fn new(
        handle: &Handle,
        bus: EventBus,
        transport: Arc<dyn SessionTransport>,
        app: AppIdentity,
        device: DeviceIdentity,
        config: &SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                handle: handle.clone(),
                bus,
                transport,
                executor: SerialExecutor::spawn(handle, "session"),
                app,
                device: Mutex::new(device),
                remote: Mutex::new(None),
                grace_window: config.grace_window(),
                default_heartbeat: config.heartbeat_interval(),
                current: Mutex::new(None),
                ready: Mutex::new(ReadyQueue::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to lifecycle, user id, device identity and remote
    /// configuration events. Calling it again is a no-op.
    pub fn register_listeners(&self) {
        let mut slot = lock(&self.inner.listener);
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.bus.add_listener(Arc::new(move |event: &TeakEvent| {
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }.handle_event(event);
            }
        }));
        *slot = Some(id);
    }

    /// Remove the listener added by [`register_listeners`](Self::register_listeners).
    pub fn unregister_listeners(&self) {
        if let Some(id) = lock(&self.inner.listener).take() {
            self.inner.bus.remove_listener(id);
        }
    }

    fn handle_event(&self, event: &TeakEvent) {
        match event {
            TeakEvent::Lifecycle(LifecycleEvent::Paused) => self.mark_paused(),
            TeakEvent::Lifecycle(LifecycleEvent::Resumed { attribution }) => {
                self.mark_resumed(attribution.clone());
            }
            TeakEvent::UserIdChanged(user_id) => self.set_user_id(user_id),
            TeakEvent::DeviceIdentityReady(device) => self.update_device_identity(device.clone()),
            TeakEvent::RemoteConfigurationReady(remote) => {
                *lock(&self.inner.remote) = Some(Arc::clone(remote));
            }
            _ => {}
        }
    }

    /// The current session, if one exists.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        lock(&self.inner.current).clone()
    }

    /// The current session, replacing it first if it is missing or expired.
    pub fn current_or_create(&self) -> Arc<Session> {
        let mut current = lock(&self.inner.current);
        self.inner.live_session(&mut current)
    }

    /// Start a new session, retiring the current one.
    pub fn create_session(&self) -> Arc<Session> {
        let mut current = lock(&self.inner.current);
        self.inner.install(&mut current, Session::new())
    }

    /// Assign the user. A different user starts a new session.
    pub fn set_user_id(&self, user_id: &str) {
        let mut current = lock(&self.inner.current);
        let existing = current.clone();
        match existing {
            None => {
                let session = Session::new();
                session.set_user_id(user_id);
                self.inner.install(&mut current, session);
            }
            Some(session) => {
                let replace = session.has_expired(self.inner.grace_window)
                    || session.user_id().is_some_and(|existing| existing != user_id);
                if replace {
                    info!(session_id = %session.id(), "User changed, starting new session");
                    let next = session.successor();
                    next.set_user_id(user_id);
                    self.inner.install(&mut current, next);
                } else {
                    session.set_user_id(user_id);
                    if session.state() == SessionState::Configured {
                        self.inner.identify(&session);
                    }
                }
            }
        }
    }

    /// The app went to the background.
    pub fn mark_paused(&self) {
        let current = lock(&self.inner.current);
        if let Some(session) = current.as_ref()
            && !session.state().is_terminal()
        {
            let _ = self.inner.transition(session, SessionState::Expiring);
        }
    }

    /// The app came back to the foreground.
    ///
    /// Within the grace window the same session is restored to the state it
    /// had before pausing. A new attribution either joins a session that is
    /// still starting up or begins a new session.
    pub fn mark_resumed(&self, attribution: Option<Attribution>) {
        let mut current = lock(&self.inner.current);
        let session = self.inner.live_session(&mut current);

        match attribution {
            Some(attribution)
                if matches!(session.state(), SessionState::Allocated | SessionState::Created) =>
            {
                session.push_attribution(attribution);
            }
            Some(attribution) => {
                info!(session_id = %session.id(), "New attribution, starting new session");
                let next = session.successor();
                next.push_attribution(attribution);
                if let Some(user_id) = session.user_id() {
                    next.set_user_id(&user_id);
                }
                self.inner.install(&mut current, next);
            }
            None => {
                if let Some(target) = session.resume_target() {
                    let _ = self.inner.transition(&session, target);
                }
            }
        }
    }

    /// Run `callback` once a user is identified.
    ///
    /// Runs on the session executor right away if the current session is
    /// already identified; otherwise it waits, in registration order, for the
    /// next session to become identified.
    pub fn when_user_id_is_ready(&self, callback: impl FnOnce(Arc<Session>) + Send + 'static) {
        let current = lock(&self.inner.current);
        let mut ready = lock(&self.inner.ready);
        match current.as_ref() {
            Some(session)
                if session.state() == SessionState::UserIdentified
                    && ready.drained_for.as_deref() == Some(session.id()) =>
            {
                let session = Arc::clone(session);
                self.inner.executor.execute(move || callback(session));
            }
            _ => ready.pending.push(Box::new(callback)),
        }
    }

    /// Replace the device identity and re-identify an identified user.
    pub fn update_device_identity(&self, device: DeviceIdentity) {
        *lock(&self.inner.device) = device;
        let current = lock(&self.inner.current);
        if let Some(session) = current.as_ref()
            && session.state() == SessionState::UserIdentified
        {
            self.inner.identify(session);
        }
    }

    /// Remote configuration known to the manager.
    pub fn remote_configuration(&self) -> Option<Arc<RemoteConfiguration>> {
        lock(&self.inner.remote).clone()
    }

    /// Request context for the current session's user.
    pub fn request_context(&self) -> RequestContext {
        let session = self.current_session();
        self.inner.context_for(session.as_deref())
    }

    /// Request context for `session`'s user.
    pub fn request_context_for(&self, session: &Session) -> RequestContext {
        self.inner.context_for(Some(session))
    }

    /// Apply a transition to `session` and run its side effects.
    pub fn transition(&self, session: &Arc<Session>, to: SessionState) -> Result<(), StateTransitionError> {
        self.inner.transition(session, to)
    }
}

impl ManagerInner {
    fn context_for(&self, session: Option<&Session>) -> RequestContext {
        let remote = session.and_then(Session::remote_configuration).or_else(|| lock(&self.remote).clone());
        RequestContext {
            app: self.app.clone(),
            device: lock(&self.device).clone(),
            user_id: session.and_then(Session::user_id),
            remote,
        }
    }

    /// Current session if it is still usable, otherwise a fresh one carrying
    /// the old user and attribution chain.
    fn live_session(self: &Arc<Self>, current: &mut Option<Arc<Session>>) -> Arc<Session> {
        match current.clone() {
            Some(session) if !session.has_expired(self.grace_window) => session,
            Some(old) => {
                let next = old.successor();
                if let Some(user_id) = old.user_id() {
                    next.set_user_id(&user_id);
                }
                self.install(current, next)
            }
            None => self.install(current, Session::new()),
        }
    }

    /// Make `next` current, retire the old session and start the new one.
    fn install(self: &Arc<Self>, current: &mut Option<Arc<Session>>, next: Session) -> Arc<Session> {
        let next = Arc::new(next);
        let old = current.replace(Arc::clone(&next));
        info!(session_id = %next.id(), "Session allocated");
        if let Some(old) = old {
            self.retire(&old);
        }
        let _ = self.transition(&next, SessionState::Created);
        next
    }

    fn retire(self: &Arc<Self>, session: &Arc<Session>) {
        if session.state().is_terminal() {
            return;
        }
        let _ = self.transition(session, SessionState::Expiring);
        let _ = self.transition(session, SessionState::Expired);
    }

    fn transition(self: &Arc<Self>, session: &Arc<Session>, to: SessionState) -> Result<(), StateTransitionError> {
        match session.apply(to) {
            Ok(Some(applied)) => {
                info!(session_id = %session.id(), from = ?applied.from, to = ?applied.to, "Session state changed");
                self.bus.post(TeakEvent::SessionStateChanged {
                    session_id: session.id().to_string(),
                    state: applied.to,
                    previous: applied.from,
                });
                self.on_entered(session, applied);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err @ StateTransitionError::Illegal { from, .. }) => {
                self.bus.post(TeakEvent::SessionStateChanged {
                    session_id: session.id().to_string(),
                    state: SessionState::Invalid,
                    previous: from,
                });
                if let Some(id) = session.take_remote_listener() {
                    self.bus.remove_listener(id);
                }
                Err(err)
            }
            Err(err) => {
                debug!(session_id = %session.id(), error = %err, "Transition on invalid session ignored");
                Err(err)
            }
        }
    }

    fn on_entered(self: &Arc<Self>, session: &Arc<Session>, applied: Applied) {
        match applied.to {
            SessionState::Created => self.on_created(session),
            SessionState::Configured => {
                if let Some(id) = session.take_remote_listener() {
                    self.bus.remove_listener(id);
                }
                self.identify(session);
            }
            SessionState::UserIdentified => {
                self.start_heartbeat(session);
                let inner = Arc::clone(self);
                self.executor.execute(move || inner.drain_ready());
            }
            SessionState::Expiring => {
                let mut ready = lock(&self.ready);
                if ready.drained_for.as_deref() == Some(session.id()) {
                    ready.drained_for = None;
                }
            }
            SessionState::Expired => {
                if let Some(id) = applied.released {
                    self.bus.remove_listener(id);
                }
            }
            SessionState::Allocated | SessionState::Invalid => {}
        }
    }

    fn on_created(self: &Arc<Self>, session: &Arc<Session>) {
        let known = session.remote_configuration().or_else(|| lock(&self.remote).clone());
        if let Some(remote) = known {
            session.set_remote_configuration(remote);
            let _ = self.transition(session, SessionState::Configured);
            return;
        }

        if !session.has_remote_listener() {
            let weak_inner = Arc::downgrade(self);
            let weak_session = Arc::downgrade(session);
            let id = self.bus.add_listener(Arc::new(move |event: &TeakEvent| {
                if let TeakEvent::RemoteConfigurationReady(remote) = event {
                    configure(&weak_inner, &weak_session, remote);
                }
            }));
            if let Some(stale) = session.set_remote_listener(id) {
                self.bus.remove_listener(stale);
            }
        }
        self.bus.post(TeakEvent::RemoteConfigurationRequested);
    }

    fn identify(self: &Arc<Self>, session: &Arc<Session>) {
        if !session.begin_identify() {
            return;
        }
        let inner = Arc::clone(self);
        let session = Arc::clone(session);
        self.executor.execute(move || inner.send_identify(session));
    }

    fn send_identify(self: Arc<Self>, session: Arc<Session>) {
        let do_not_track = session.state() == SessionState::UserIdentified;
        let device = lock(&self.device).clone();
        let payload = identify_payload(&session, &device, do_not_track);
        let context = self.context_for(Some(&session));
        info!(
            session_id = %session.id(),
            user_id = ?context.user_id,
            do_not_track_event = do_not_track,
            "Identifying user"
        );

        let weak = Arc::downgrade(&self);
        let done_session = Arc::clone(&session);
        self.transport.identify_user(
            context,
            payload,
            Box::new(move |response: Response| {
                if let Some(inner) = weak.upgrade() {
                    inner.identify_complete(&done_session, &response);
                }
            }),
        );
    }

    fn identify_complete(self: &Arc<Self>, session: &Arc<Session>, response: &Response) {
        debug!(session_id = %session.id(), status = response.status, "Identify complete");
        let body = response.json();
        if session.finish_identify(body.as_ref()) {
            let _ = self.transition(session, SessionState::UserIdentified);
        }
    }

    fn start_heartbeat(self: &Arc<Self>, session: &Arc<Session>) {
        let interval = session
            .remote_configuration()
            .map_or(self.default_heartbeat, |remote| remote.heartbeat_interval)
            .max(MIN_HEARTBEAT_INTERVAL);
        let weak_inner = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let (Some(inner), Some(session)) = (weak_inner.upgrade(), weak_session.upgrade()) else {
                    break;
                };
                if session.state() != SessionState::UserIdentified {
                    break;
                }
                debug!(session_id = %session.id(), "Heartbeat");
                inner.transport.heartbeat(inner.context_for(Some(&session)));
            }
        });
        session.set_heartbeat(task);
    }

    /// Hand every queued ready callback to the executor, in order.
    fn drain_ready(&self) {
        let current = lock(&self.current);
        let Some(session) = current.as_ref().filter(|s| s.state() == SessionState::UserIdentified) else {
            return;
        };
        let mut ready = lock(&self.ready);
        ready.drained_for = Some(session.id().to_string());
        let pending = std::mem::take(&mut ready.pending);
        if !pending.is_empty() {
            debug!(session_id = %session.id(), count = pending.len(), "Running user id ready callbacks");
        }
        for callback in pending {
            let session = Arc::clone(session);
            if !self.executor.execute(move || callback(session)) {
                warn!("Session executor is gone, dropping ready callback");
            }
        }
    }
}

fn configure(inner: &Weak<ManagerInner>, session: &Weak<Session>, remote: &Arc<RemoteConfiguration>) {
    let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) else {
        return;
    };
    if session.state() != SessionState::Created {
        return;
    }
    session.set_remote_configuration(Arc::clone(remote));
    let _ = inner.transition(&session, SessionState::Configured);
}
