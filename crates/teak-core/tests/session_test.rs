//! Session manager integration tests: the lifecycle from allocation to
//! identification, pause and resume, user changes and ready callbacks.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{app, device, eventually};
use serde_json::json;
use teak_core::config::SessionConfig;
use teak_core::{
    Attribution, EventBus, Payload, RemoteConfiguration, RequestContext, Response, ResponseCallback, Session,
    SessionManager, SessionState, SessionTransport, TeakEvent,
};
use tokio::runtime::Handle;

#[derive(Default)]
struct RecordingTransport {
    identifies: Mutex<Vec<(RequestContext, Payload)>>,
    heartbeats: AtomicUsize,
}

impl RecordingTransport {
    fn identify_count(&self) -> usize {
        self.identifies.lock().unwrap().len()
    }

    fn last_identify(&self) -> (RequestContext, Payload) {
        self.identifies.lock().unwrap().last().cloned().unwrap()
    }
}

impl SessionTransport for RecordingTransport {
    fn identify_user(&self, context: RequestContext, payload: Payload, done: ResponseCallback) {
        self.identifies.lock().unwrap().push((context, payload));
        done(Response::new(200, r#"{"country_code": "NZ", "verbose_logging": true}"#));
    }

    fn heartbeat(&self, _context: RequestContext) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    manager: SessionManager,
    bus: EventBus,
    transport: Arc<RecordingTransport>,
    events: Arc<Mutex<Vec<TeakEvent>>>,
}

impl Harness {
    fn new(config: &SessionConfig) -> Self {
        let handle = Handle::current();
        let bus = EventBus::new(&handle);
        let transport = Arc::new(RecordingTransport::default());
        let manager = SessionManager::new(&handle, bus.clone(), transport.clone(), app(), device(), config);
        manager.register_listeners();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.add_listener(Arc::new(move |event: &TeakEvent| sink.lock().unwrap().push(event.clone())));
        Self { manager, bus, transport, events }
    }

    fn configure(&self) {
        self.bus.post(TeakEvent::RemoteConfigurationReady(Arc::new(RemoteConfiguration::new("api.teak.test"))));
    }

    /// Identify `user_id` and wait until the session reaches UserIdentified.
    async fn identified(&self, user_id: &str) -> Arc<Session> {
        self.manager.set_user_id(user_id);
        self.configure();
        let manager = self.manager.clone();
        assert!(
            eventually(|| manager.current_session().is_some_and(|s| s.state() == SessionState::UserIdentified)).await
        );
        self.manager.current_session().unwrap()
    }

    fn states_for(&self, session_id: &str) -> Vec<SessionState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                TeakEvent::SessionStateChanged { session_id: id, state, .. } if id == session_id => Some(*state),
                _ => None,
            })
            .collect()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_reaches_user_identified() {
    let harness = Harness::new(&SessionConfig::default());

    let session = harness.identified("user-1").await;
    assert!(eventually(|| harness.states_for(session.id()).len() == 3).await);

    assert_eq!(
        harness.states_for(session.id()),
        vec![SessionState::Created, SessionState::Configured, SessionState::UserIdentified]
    );
    assert!(harness.events.lock().unwrap().iter().any(|e| matches!(e, TeakEvent::RemoteConfigurationRequested)));
    assert_eq!(session.user_id().as_deref(), Some("user-1"));
    assert_eq!(session.country_code().as_deref(), Some("NZ"));
    assert!(session.verbose_logging());
    assert_eq!(session.remote_configuration().unwrap().hostname, "api.teak.test");

    assert_eq!(harness.transport.identify_count(), 1);
    let (context, payload) = harness.transport.last_identify();
    assert_eq!(context.user_id.as_deref(), Some("user-1"));
    assert!(!payload.contains_key("do_not_track_event"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_listener_removed_once_configured() {
    let harness = Harness::new(&SessionConfig::default());
    let baseline = harness.bus.listener_count();

    harness.manager.create_session();
    assert_eq!(harness.bus.listener_count(), baseline + 1);

    harness.configure();
    harness.bus.flush().await;
    let session = harness.manager.current_session().unwrap();
    assert_eq!(session.state(), SessionState::Configured);
    assert_eq!(harness.bus.listener_count(), baseline);
    // No user yet, so nothing to identify.
    assert_eq!(harness.transport.identify_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ready_callbacks_run_once_in_order() {
    let harness = Harness::new(&SessionConfig::default());
    let order = Arc::new(Mutex::new(Vec::new()));

    for n in 0..3 {
        let order = Arc::clone(&order);
        harness.manager.when_user_id_is_ready(move |session| {
            order.lock().unwrap().push((n, session.user_id()));
        });
    }
    assert!(order.lock().unwrap().is_empty());

    harness.identified("user-1").await;
    let seen = Arc::clone(&order);
    assert!(eventually(|| seen.lock().unwrap().len() == 3).await);

    let late = Arc::clone(&order);
    harness.manager.when_user_id_is_ready(move |session| {
        late.lock().unwrap().push((3, session.user_id()));
    });
    let seen = Arc::clone(&order);
    assert!(eventually(|| seen.lock().unwrap().len() == 4).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let user = Some("user-1".to_string());
    assert_eq!(
        *order.lock().unwrap(),
        vec![(0, user.clone()), (1, user.clone()), (2, user.clone()), (3, user)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_resume_within_grace_keeps_session() {
    let harness = Harness::new(&SessionConfig::default());
    let session = harness.identified("user-1").await;

    harness.manager.mark_paused();
    assert_eq!(session.state(), SessionState::Expiring);
    assert!(session.end_date().is_some());

    harness.manager.mark_resumed(None);
    let current = harness.manager.current_session().unwrap();
    assert_eq!(current.id(), session.id());
    assert_eq!(current.state(), SessionState::UserIdentified);
    assert!(current.end_date().is_none());
    assert_eq!(harness.transport.identify_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_after_grace_starts_new_session() {
    let config = SessionConfig { grace_window_secs: 0, ..SessionConfig::default() };
    let harness = Harness::new(&config);
    let session = harness.identified("user-1").await;

    harness.manager.mark_paused();
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.manager.mark_resumed(None);

    let current = harness.manager.current_session().unwrap();
    assert_ne!(current.id(), session.id());
    assert_eq!(session.state(), SessionState::Expired);
    assert_eq!(current.user_id().as_deref(), Some("user-1"));

    let manager = harness.manager.clone();
    assert!(
        eventually(|| manager.current_session().is_some_and(|s| s.state() == SessionState::UserIdentified)).await
    );
    assert_eq!(harness.transport.identify_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_change_replaces_session() {
    let harness = Harness::new(&SessionConfig::default());
    let first = harness.identified("user-1").await;

    harness.manager.set_user_id("user-1");
    assert_eq!(harness.manager.current_session().unwrap().id(), first.id());

    harness.manager.set_user_id("user-2");
    let second = harness.manager.current_session().unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(first.state(), SessionState::Expired);
    assert_eq!(second.user_id().as_deref(), Some("user-2"));

    let manager = harness.manager.clone();
    assert!(
        eventually(|| manager.current_session().is_some_and(|s| s.state() == SessionState::UserIdentified)).await
    );
    let (context, _) = harness.transport.last_identify();
    assert_eq!(context.user_id.as_deref(), Some("user-2"));
    assert_eq!(harness.transport.identify_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attribution_on_resume_starts_new_session() {
    let harness = Harness::new(&SessionConfig::default());
    let first = harness.identified("user-1").await;

    harness.manager.mark_paused();
    harness.manager.mark_resumed(Some(Attribution::Notification("42".into())));

    let second = harness.manager.current_session().unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(first.state(), SessionState::Expired);
    assert_eq!(second.attribution_chain(), vec![Attribution::Notification("42".into())]);

    let transport = Arc::clone(&harness.transport);
    assert!(eventually(|| transport.identify_count() == 2).await);
    let (_, payload) = harness.transport.last_identify();
    assert_eq!(payload["teak_notif_id"], json!("42"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attribution_joins_starting_session() {
    let harness = Harness::new(&SessionConfig::default());
    let session = harness.manager.create_session();

    harness.manager.mark_resumed(Some(Attribution::DeepLink("teak1234://store".into())));

    let current = harness.manager.current_session().unwrap();
    assert_eq!(current.id(), session.id());
    assert_eq!(current.attribution_chain().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_events_drive_manager() {
    let harness = Harness::new(&SessionConfig::default());
    let session = harness.identified("user-1").await;

    harness.bus.post(TeakEvent::Lifecycle(teak_core::LifecycleEvent::Paused));
    harness.bus.flush().await;
    assert_eq!(session.state(), SessionState::Expiring);

    harness.bus.post(TeakEvent::Lifecycle(teak_core::LifecycleEvent::Resumed { attribution: None }));
    harness.bus.flush().await;
    assert_eq!(session.state(), SessionState::UserIdentified);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_update_reidentifies_without_tracking() {
    let harness = Harness::new(&SessionConfig::default());
    harness.identified("user-1").await;

    let mut updated = device();
    updated.push_token = Some("push-1".into());
    harness.manager.update_device_identity(updated);

    let transport = Arc::clone(&harness.transport);
    assert!(eventually(|| transport.identify_count() == 2).await);
    let (_, payload) = harness.transport.last_identify();
    assert_eq!(payload["do_not_track_event"], json!(true));
    assert_eq!(payload["push_token"], json!("push-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_current_or_create_reuses_live_session() {
    let harness = Harness::new(&SessionConfig::default());
    assert!(harness.manager.current_session().is_none());

    let created = harness.manager.current_or_create();
    assert_eq!(created.state(), SessionState::Created);
    assert_eq!(harness.manager.current_session().unwrap().id(), created.id());

    harness.manager.mark_paused();
    assert_eq!(created.state(), SessionState::Expiring);
    let again = harness.manager.current_or_create();
    assert_eq!(again.id(), created.id());
    assert_eq!(again.state(), SessionState::Expiring);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_current_or_create_replaces_expired_session() {
    let config = SessionConfig { grace_window_secs: 0, ..SessionConfig::default() };
    let harness = Harness::new(&config);

    harness.manager.set_user_id("user-1");
    harness.manager.mark_resumed(Some(Attribution::DeepLink("teak1234://store".into())));
    let old = harness.manager.current_session().unwrap();
    assert_eq!(old.attribution_chain().len(), 1);

    harness.manager.mark_paused();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let next = harness.manager.current_or_create();
    assert_ne!(next.id(), old.id());
    assert_eq!(old.state(), SessionState::Expired);
    assert_eq!(next.state(), SessionState::Created);
    assert_eq!(next.user_id().as_deref(), Some("user-1"));
    assert_eq!(next.attribution_chain(), old.attribution_chain());
    assert_eq!(harness.manager.current_session().unwrap().id(), next.id());
}
