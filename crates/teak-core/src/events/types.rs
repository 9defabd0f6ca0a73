//! Event types delivered on the [`EventBus`](super::EventBus).

use std::sync::Arc;

use crate::config::{DeviceIdentity, RemoteConfiguration};
use crate::session::{Attribution, SessionState};

/// Host application lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The app moved to the background.
    Paused,
    /// The app returned to the foreground, possibly via a notification or link.
    Resumed {
        /// What brought the user back, if anything.
        attribution: Option<Attribution>,
    },
}

/// Internal event carried on the bus.
#[derive(Debug, Clone)]
pub enum TeakEvent {
    /// App lifecycle change.
    Lifecycle(LifecycleEvent),
    /// The host app identified the user.
    UserIdChanged(String),
    /// Device identity became available or changed.
    DeviceIdentityReady(DeviceIdentity),
    /// A component needs the remote configuration.
    RemoteConfigurationRequested,
    /// A new remote configuration snapshot is available.
    RemoteConfigurationReady(Arc<RemoteConfiguration>),
    /// A session applied a state transition.
    SessionStateChanged {
        /// Session identifier.
        session_id: String,
        /// State after the transition.
        state: SessionState,
        /// State before the transition.
        previous: SessionState,
    },
    /// A request was written to the persistent cache.
    RequestCached {
        /// Request identifier.
        request_id: String,
        /// Endpoint path.
        endpoint: String,
    },
    /// A cached request received a response.
    CachedRequestResolved {
        /// Request identifier.
        request_id: String,
        /// HTTP status.
        status: u16,
        /// True when the row was deleted, false when kept for retry.
        deleted: bool,
    },
}

impl TeakEvent {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Lifecycle(LifecycleEvent::Paused) => "lifecycle_paused",
            Self::Lifecycle(LifecycleEvent::Resumed { .. }) => "lifecycle_resumed",
            Self::UserIdChanged(_) => "user_id_changed",
            Self::DeviceIdentityReady(_) => "device_identity_ready",
            Self::RemoteConfigurationRequested => "remote_configuration_requested",
            Self::RemoteConfigurationReady(_) => "remote_configuration_ready",
            Self::SessionStateChanged { .. } => "session_state_changed",
            Self::RequestCached { .. } => "request_cached",
            Self::CachedRequestResolved { .. } => "cached_request_resolved",
        }
    }
}

/// Receives events from the bus.
///
/// Listeners run one at a time on the bus dispatcher, so they must not block
/// for long.
pub trait EventListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &TeakEvent);
}

impl<F> EventListener for F
where
    F: Fn(&TeakEvent) + Send + Sync,
{
    fn on_event(&self, event: &TeakEvent) {
        self(event);
    }
}

/// Handle returned by [`EventBus::add_listener`](super::EventBus::add_listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
