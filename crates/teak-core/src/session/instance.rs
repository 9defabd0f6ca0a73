//! A single engagement session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::error;
use uuid::Uuid;

use super::state::{Attribution, SessionState, StateTransitionError};
use crate::config::RemoteConfiguration;
use crate::events::ListenerId;
use crate::request::Payload;
use crate::sync::lock;

/// Outcome of an applied transition.
#[derive(Debug)]
pub(crate) struct Applied {
    pub(crate) from: SessionState,
    pub(crate) to: SessionState,
    /// Bus listener to unregister, set when the session expires.
    pub(crate) released: Option<ListenerId>,
}

#[derive(Default)]
struct SessionInner {
    state: SessionState,
    previous_state: Option<SessionState>,
    invalid: bool,
    user_id: Option<String>,
    end_date: Option<DateTime<Utc>>,
    expiring_since: Option<Instant>,
    attribution_chain: Vec<Attribution>,
    remote: Option<Arc<RemoteConfiguration>>,
    country_code: Option<String>,
    verbose_logging: bool,
    heartbeat: Option<JoinHandle<()>>,
    remote_listener: Option<ListenerId>,
    identify_in_flight: bool,
}

/// Bounded period of user engagement.
///
/// Identity fields are immutable. Everything else sits behind a per-session
/// lock, separate from the manager's current-session pointer.
pub struct Session {
    id: String,
    start_date: DateTime<Utc>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("start_date", &self.start_date)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start_date: Utc::now(),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// New session carrying this one's attribution chain forward.
    pub(crate) fn successor(&self) -> Self {
        let next = Self::new();
        lock(&next.inner).attribution_chain = self.attribution_chain();
        next
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    /// Observable state. An invalidated session reports
    /// [`SessionState::Invalid`] regardless of its stored state.
    pub fn state(&self) -> SessionState {
        let inner = lock(&self.inner);
        if inner.invalid { SessionState::Invalid } else { inner.state }
    }

    /// Last state applied by a legal transition.
    pub fn stored_state(&self) -> SessionState {
        lock(&self.inner).state
    }

    /// State before the most recent transition.
    pub fn previous_state(&self) -> Option<SessionState> {
        lock(&self.inner).previous_state
    }

    pub fn user_id(&self) -> Option<String> {
        lock(&self.inner).user_id.clone()
    }

    /// When the session started expiring.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner).end_date
    }

    /// Deep links and notifications that led into this session, oldest first.
    pub fn attribution_chain(&self) -> Vec<Attribution> {
        lock(&self.inner).attribution_chain.clone()
    }

    pub fn country_code(&self) -> Option<String> {
        lock(&self.inner).country_code.clone()
    }

    /// Whether the server asked for verbose logging on identify.
    pub fn verbose_logging(&self) -> bool {
        lock(&self.inner).verbose_logging
    }

    pub fn remote_configuration(&self) -> Option<Arc<RemoteConfiguration>> {
        lock(&self.inner).remote.clone()
    }

    /// Whether the session is over: terminal, or expiring for longer than
    /// `grace`.
    pub fn has_expired(&self, grace: Duration) -> bool {
        let inner = lock(&self.inner);
        if inner.invalid || inner.state == SessionState::Expired {
            return true;
        }
        inner.state == SessionState::Expiring && inner.expiring_since.is_some_and(|since| since.elapsed() > grace)
    }

    /// Apply a transition under the session lock.
    ///
    /// Returns `Ok(None)` when already in `to`. An illegal edge leaves the
    /// stored state untouched and marks the session invalid; only the first
    /// such attempt reports [`StateTransitionError::Illegal`].
    pub(crate) fn apply(&self, to: SessionState) -> Result<Option<Applied>, StateTransitionError> {
        let mut inner = lock(&self.inner);
        if inner.invalid {
            return Err(StateTransitionError::SessionInvalid(self.id.clone()));
        }
        let from = inner.state;
        if from == to {
            return Ok(None);
        }
        if !from.can_transition_to(to) {
            inner.invalid = true;
            error!(session_id = %self.id, from = ?from, to = ?to, "Invalid state transition");
            return Err(StateTransitionError::Illegal { from, to });
        }

        inner.previous_state = Some(from);
        inner.state = to;
        let mut released = None;
        match to {
            SessionState::Expiring => {
                inner.end_date = Some(Utc::now());
                inner.expiring_since = Some(Instant::now());
                // An identify dropped before completing must not block the
                // one sent on resume.
                inner.identify_in_flight = false;
                if let Some(heartbeat) = inner.heartbeat.take() {
                    heartbeat.abort();
                }
            }
            SessionState::Expired => {
                if let Some(heartbeat) = inner.heartbeat.take() {
                    heartbeat.abort();
                }
                released = inner.remote_listener.take();
            }
            SessionState::Created | SessionState::Configured | SessionState::UserIdentified => {
                inner.end_date = None;
                inner.expiring_since = None;
            }
            SessionState::Allocated | SessionState::Invalid => {}
        }
        Ok(Some(Applied { from, to, released }))
    }

    pub(crate) fn set_user_id(&self, user_id: &str) {
        lock(&self.inner).user_id = Some(user_id.to_string());
    }

    pub(crate) fn push_attribution(&self, attribution: Attribution) {
        lock(&self.inner).attribution_chain.push(attribution);
    }

    pub(crate) fn set_remote_configuration(&self, remote: Arc<RemoteConfiguration>) {
        lock(&self.inner).remote = Some(remote);
    }

    /// State to restore on resume. `Allocated` cannot be re-entered, so it
    /// resumes as `Created`.
    pub(crate) fn resume_target(&self) -> Option<SessionState> {
        let inner = lock(&self.inner);
        if inner.state != SessionState::Expiring || inner.invalid {
            return None;
        }
        match inner.previous_state {
            Some(SessionState::Allocated) | None => Some(SessionState::Created),
            other => other,
        }
    }

    pub(crate) fn set_heartbeat(&self, heartbeat: JoinHandle<()>) {
        if let Some(previous) = lock(&self.inner).heartbeat.replace(heartbeat) {
            previous.abort();
        }
    }

    pub(crate) fn set_remote_listener(&self, id: ListenerId) -> Option<ListenerId> {
        lock(&self.inner).remote_listener.replace(id)
    }

    pub(crate) fn take_remote_listener(&self) -> Option<ListenerId> {
        lock(&self.inner).remote_listener.take()
    }

    pub(crate) fn has_remote_listener(&self) -> bool {
        lock(&self.inner).remote_listener.is_some()
    }

    /// Claim the identify slot. Fails while another identify is outstanding,
    /// without a user id, or outside Configured/UserIdentified.
    pub(crate) fn begin_identify(&self) -> bool {
        let mut inner = lock(&self.inner);
        let eligible = !inner.invalid
            && inner.user_id.is_some()
            && matches!(inner.state, SessionState::Configured | SessionState::UserIdentified);
        if !eligible || inner.identify_in_flight {
            return false;
        }
        inner.identify_in_flight = true;
        true
    }

    /// Record identify response fields and decide what the completion means.
    ///
    /// Returns true when the session should now enter UserIdentified. An
    /// expiring session instead restores to UserIdentified on resume.
    pub(crate) fn finish_identify(&self, response: Option<&Payload>) -> bool {
        let mut inner = lock(&self.inner);
        inner.identify_in_flight = false;
        if let Some(response) = response {
            if let Some(code) = response.get("country_code").and_then(|v| v.as_str()) {
                inner.country_code = Some(code.to_string());
            }
            inner.verbose_logging = response.get("verbose_logging").and_then(serde_json::Value::as_bool).unwrap_or(false);
        }
        if inner.invalid {
            return false;
        }
        match inner.state {
            SessionState::Expiring => {
                inner.previous_state = Some(SessionState::UserIdentified);
                false
            }
            SessionState::Configured => true,
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_state(state: SessionState) -> Self {
        let session = Self::new();
        lock(&session.inner).state = state;
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_illegal_transition_keeps_stored_state_and_invalidates_once() {
        for from in SessionState::ALL.into_iter().filter(|s| *s != SessionState::Invalid) {
            for to in SessionState::ALL {
                if from == to || from.can_transition_to(to) {
                    continue;
                }
                let session = Session::with_state(from);
                let err = session.apply(to).unwrap_err();
                assert_eq!(err, StateTransitionError::Illegal { from, to });
                assert_eq!(session.stored_state(), from, "{from} -> {to}");
                assert_eq!(session.state(), SessionState::Invalid);

                // Further attempts report the invalid session, not a new illegal edge.
                let again = session.apply(to).unwrap_err();
                assert!(matches!(again, StateTransitionError::SessionInvalid(_)));
                assert!(matches!(session.apply(from), Err(StateTransitionError::SessionInvalid(_))));
            }
        }
    }

    #[test]
    fn test_same_state_is_noop() {
        let session = Session::with_state(SessionState::Configured);
        assert!(session.apply(SessionState::Configured).unwrap().is_none());
        assert_eq!(session.previous_state(), None);
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_expiring_records_end_date() {
        let session = Session::with_state(SessionState::UserIdentified);
        let applied = session.apply(SessionState::Expiring).unwrap().unwrap();
        assert_eq!(applied.from, SessionState::UserIdentified);
        assert!(session.end_date().is_some());
        assert_eq!(session.previous_state(), Some(SessionState::UserIdentified));
        assert_eq!(session.resume_target(), Some(SessionState::UserIdentified));

        session.apply(SessionState::UserIdentified).unwrap();
        assert!(session.end_date().is_none());
    }

    #[test]
    fn test_expired_releases_remote_listener() {
        let session = Session::with_state(SessionState::Expiring);
        session.set_remote_listener(ListenerId(4));
        let applied = session.apply(SessionState::Expired).unwrap().unwrap();
        assert_eq!(applied.released, Some(ListenerId(4)));
        assert!(!session.has_remote_listener());
        assert!(session.has_expired(Duration::from_secs(1_000)));
    }

    #[test]
    fn test_successor_copies_attribution_chain_only() {
        let session = Session::new();
        session.set_user_id("u1");
        session.push_attribution(Attribution::Notification("n1".into()));
        let next = session.successor();
        assert_ne!(next.id(), session.id());
        assert_eq!(next.attribution_chain(), session.attribution_chain());
        assert_eq!(next.user_id(), None);
        assert_eq!(next.state(), SessionState::Allocated);
    }

    #[test]
    fn test_identify_slot() {
        let session = Session::with_state(SessionState::Configured);
        assert!(!session.begin_identify());
        session.set_user_id("u1");
        assert!(session.begin_identify());
        assert!(!session.begin_identify());

        let response = json!({"country_code": "NZ", "verbose_logging": true});
        assert!(session.finish_identify(response.as_object()));
        assert_eq!(session.country_code().as_deref(), Some("NZ"));
        assert!(session.verbose_logging());
        assert!(session.begin_identify());
    }

    #[test]
    fn test_identify_completion_while_expiring() {
        let session = Session::with_state(SessionState::Configured);
        session.set_user_id("u1");
        assert!(session.begin_identify());
        session.apply(SessionState::Expiring).unwrap();
        assert!(!session.finish_identify(None));
        assert_eq!(session.resume_target(), Some(SessionState::UserIdentified));
    }

    #[test]
    fn test_pause_frees_identify_slot_of_dropped_request() {
        let session = Session::with_state(SessionState::Configured);
        session.set_user_id("u1");
        assert!(session.begin_identify());

        // The request was dropped, so finish_identify never runs.
        session.apply(SessionState::Expiring).unwrap();
        let target = session.resume_target().unwrap();
        assert_eq!(target, SessionState::Configured);
        session.apply(target).unwrap();
        assert!(session.begin_identify());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window() {
        let session = Session::with_state(SessionState::UserIdentified);
        session.apply(SessionState::Expiring).unwrap();
        assert!(!session.has_expired(Duration::from_secs(120)));
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(session.has_expired(Duration::from_secs(120)));
    }
}
