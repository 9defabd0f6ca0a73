//! SDK facade wiring the bus, session manager, request engine and cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AppIdentity, DeviceIdentity, RemoteConfiguration, SdkConfig};
use crate::error::{Result, TeakError};
use crate::events::{EventBus, LifecycleEvent, ListenerId, TeakEvent};
use crate::request::{
    HttpTransport, Payload, Request, RequestContext, RequestEngine, Response, ResponseCallback, TransportError,
};
use crate::session::{Attribution, Session, SessionManager, SessionTransport, identify_endpoint};
use crate::storage::{CacheDatabase, PersistentRequestCache};

/// Endpoint serving the remote configuration for `app_id`.
pub fn settings_endpoint(app_id: &str) -> String {
    format!("/games/{app_id}/settings.json")
}

/// Sends identify calls through the persistent cache and heartbeats straight
/// to the heartbeat host.
struct CoreTransport {
    handle: Handle,
    cache: Arc<PersistentRequestCache>,
    http: Arc<dyn HttpTransport>,
    scheme: String,
    heartbeat_host: String,
}

impl SessionTransport for CoreTransport {
    fn identify_user(&self, context: RequestContext, payload: Payload, done: ResponseCallback) {
        let endpoint = identify_endpoint(&context.app.app_id);
        self.cache.submit(&context, &endpoint, payload, Some(done));
    }

    fn heartbeat(&self, context: RequestContext) {
        let base = format!("{}://{}/ping", self.scheme, self.heartbeat_host);
        let params = [
            ("game_id", context.app.app_id.clone()),
            ("api_key", context.user_id.clone().unwrap_or_default()),
            ("sdk_version", crate::config::SDK_VERSION.to_string()),
            ("sdk_platform", context.device.platform.clone()),
            ("app_version", context.app.app_version.clone()),
            ("buster", Uuid::new_v4().to_string()),
        ];
        let url = match reqwest::Url::parse_with_params(&base, &params) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid heartbeat URL");
                return;
            }
        };
        let http = Arc::clone(&self.http);
        self.handle.spawn(async move {
            if let Err(e) = http.get(url.as_str()).await {
                debug!(error = %e, "Heartbeat failed");
            }
        });
    }
}

/// Forwards host lifecycle callbacks to the bus.
#[derive(Debug, Clone)]
pub struct LifecycleAdapter {
    bus: EventBus,
}

impl LifecycleAdapter {
    /// The app moved to the background.
    pub fn on_paused(&self) {
        self.bus.post(TeakEvent::Lifecycle(LifecycleEvent::Paused));
    }

    /// The app came to the foreground, optionally via a notification or link.
    pub fn on_resumed(&self, attribution: Option<Attribution>) {
        self.bus.post(TeakEvent::Lifecycle(LifecycleEvent::Resumed { attribution }));
    }
}

struct TeakInner {
    handle: Handle,
    config: SdkConfig,
    app: AppIdentity,
    bus: EventBus,
    sessions: SessionManager,
    engine: RequestEngine,
    cache: Arc<PersistentRequestCache>,
    fetching: AtomicBool,
    resubmitted: AtomicBool,
}

/// Entry point for host applications.
pub struct Teak {
    inner: Arc<TeakInner>,
    listener: ListenerId,
}

impl std::fmt::Debug for Teak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teak").field("app_id", &self.inner.app.app_id).finish_non_exhaustive()
    }
}

impl Teak {
    /// Build and wire every component. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TeakError::Config` if `app_id` or `api_key` is missing or no
    /// runtime is available, and `TeakError::Storage` if the cache database
    /// cannot be opened.
    pub fn new(
        config: SdkConfig,
        app: AppIdentity,
        device: DeviceIdentity,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        app.validate()?;
        let handle = Handle::try_current()
            .map_err(|e| TeakError::Config(format!("a tokio runtime is required: {e}")))?;

        let bus = EventBus::new(&handle);
        let engine = RequestEngine::new(&handle, Arc::clone(&transport), &config.transport);
        let db = CacheDatabase::new(&config.cache.path);
        let cache = Arc::new(PersistentRequestCache::open(&handle, db, engine.clone(), bus.clone())?);

        let session_transport = Arc::new(CoreTransport {
            handle: handle.clone(),
            cache: Arc::clone(&cache),
            http: transport,
            scheme: config.transport.scheme.clone(),
            heartbeat_host: config.transport.heartbeat_host.clone(),
        });
        let sessions =
            SessionManager::new(&handle, bus.clone(), session_transport, app.clone(), device, &config.session);
        sessions.register_listeners();

        let inner = Arc::new(TeakInner {
            handle,
            config,
            app,
            bus: bus.clone(),
            sessions,
            engine,
            cache,
            fetching: AtomicBool::new(false),
            resubmitted: AtomicBool::new(false),
        });

        let weak: Weak<TeakInner> = Arc::downgrade(&inner);
        let listener = bus.add_listener(Arc::new(move |event: &TeakEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        }));

        info!(app_id = %inner.app.app_id, "Teak initialized");
        Ok(Self { inner, listener })
    }

    /// Lifecycle adapter for the host's foreground/background callbacks.
    pub fn lifecycle(&self) -> LifecycleAdapter {
        LifecycleAdapter { bus: self.inner.bus.clone() }
    }

    /// Identify the current user.
    pub fn identify_user(&self, user_id: &str) {
        self.inner.bus.post(TeakEvent::UserIdChanged(user_id.to_string()));
    }

    /// Replace the device identity.
    pub fn set_device_identity(&self, device: DeviceIdentity) {
        self.inner.bus.post(TeakEvent::DeviceIdentityReady(device));
    }

    /// Track an event once a user is identified.
    pub fn track_event(&self, action_type: &str, object_type: Option<&str>, object_instance_id: Option<&str>) {
        let weak = Arc::downgrade(&self.inner);
        let action_type = action_type.to_string();
        let object_type = object_type.map(str::to_string);
        let object_instance_id = object_instance_id.map(str::to_string);
        self.inner.sessions.when_user_id_is_ready(move |session: Arc<Session>| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let context = inner.sessions.request_context_for(&session);
            inner.engine.track_event(&context, &action_type, object_type.as_deref(), object_instance_id.as_deref(), 0);
        });
    }

    /// Run `callback` once a user is identified.
    pub fn when_user_id_is_ready(&self, callback: impl FnOnce(Arc<Session>) + Send + 'static) {
        self.inner.sessions.when_user_id_is_ready(callback);
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn engine(&self) -> &RequestEngine {
        &self.inner.engine
    }

    pub fn cache(&self) -> &PersistentRequestCache {
        &self.inner.cache
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Stop listening, deliver queued events and stop the bus worker.
    pub async fn shutdown(&self) {
        self.inner.sessions.unregister_listeners();
        self.inner.bus.remove_listener(self.listener);
        self.inner.bus.flush().await;
        self.inner.bus.shutdown();
        info!(app_id = %self.inner.app.app_id, "Teak shut down");
    }
}

impl TeakInner {
    fn handle_event(self: &Arc<Self>, event: &TeakEvent) {
        match event {
            TeakEvent::RemoteConfigurationRequested => self.fetch_remote_configuration(),
            TeakEvent::RemoteConfigurationReady(remote) => {
                self.engine.set_remote_configuration(Arc::clone(remote));
                if !self.resubmitted.swap(true, Ordering::AcqRel) {
                    let context = self.sessions.request_context();
                    self.cache.resubmit_all(&context.with_remote(Arc::clone(remote)));
                }
            }
            _ => {}
        }
    }

    /// Fetch settings unless a fetch is already running.
    fn fetch_remote_configuration(self: &Arc<Self>) {
        if self.fetching.swap(true, Ordering::AcqRel) {
            return;
        }
        let transport = &self.config.transport;
        let context = self.sessions.request_context();
        let mut payload = Payload::new();
        payload.insert("id".into(), Value::from(self.app.app_id.as_str()));
        let request = Request::new(&context, settings_endpoint(&self.app.app_id), payload)
            .with_hostname(transport.settings_host.as_str());
        info!(hostname = %transport.settings_host, "Fetching remote configuration");

        let inner = Arc::clone(self);
        self.handle.spawn(async move {
            let result = inner.engine.send(&request).await;
            inner.remote_configuration_fetched(result);
        });
    }

    fn remote_configuration_fetched(&self, result: std::result::Result<Response, TransportError>) {
        self.fetching.store(false, Ordering::Release);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Remote configuration fetch failed");
                return;
            }
        };
        if !(200..300).contains(&response.status) {
            warn!(status = response.status, "Remote configuration fetch failed");
            return;
        }
        match RemoteConfiguration::from_settings_json(&response.body, &self.config.transport.settings_host) {
            Ok(remote) => {
                info!(hostname = %remote.hostname, "Remote configuration ready");
                self.bus.post(TeakEvent::RemoteConfigurationReady(Arc::new(remote)));
            }
            Err(e) => warn!(error = %e, "Remote configuration response is not valid JSON"),
        }
    }
}
