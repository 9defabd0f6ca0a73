//! Session states, the allowed transitions between them and attribution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a [`Session`](super::Session).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Constructed, not yet started.
    #[default]
    Allocated,
    /// Started, waiting for remote configuration.
    Created,
    /// Remote configuration known, waiting for a user id.
    Configured,
    /// The server acknowledged the user.
    UserIdentified,
    /// The app is in the background; the session may still be resumed.
    Expiring,
    /// Finished. Terminal.
    Expired,
    /// An illegal transition was attempted. Terminal.
    Invalid,
}

impl SessionState {
    /// Whether a session may move from `self` to `to`.
    ///
    /// Staying in the same state is not a transition and is handled by the
    /// caller as a no-op.
    pub fn can_transition_to(self, to: Self) -> bool {
        use SessionState::{Allocated, Configured, Created, Expired, Expiring, Invalid, UserIdentified};
        match self {
            Allocated => matches!(to, Created | Expiring),
            Created => matches!(to, Configured | Expiring),
            Configured => matches!(to, UserIdentified | Expiring),
            UserIdentified => matches!(to, Expiring),
            Expiring => matches!(to, Created | Configured | UserIdentified | Expired),
            Expired | Invalid => false,
        }
    }

    /// True for states with no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Invalid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allocated => "Allocated",
            Self::Created => "Created",
            Self::Configured => "Configured",
            Self::UserIdentified => "UserIdentified",
            Self::Expiring => "Expiring",
            Self::Expired => "Expired",
            Self::Invalid => "Invalid",
        }
    }

    /// Every state, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Allocated,
        Self::Created,
        Self::Configured,
        Self::UserIdentified,
        Self::Expiring,
        Self::Expired,
        Self::Invalid,
    ];
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What brought the user into a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Attribution {
    /// Launched from a Teak notification with this id.
    Notification(String),
    /// Launched from a deep link.
    DeepLink(String),
}

impl Attribution {
    /// Payload key the server expects for this attribution.
    pub fn payload_key(&self) -> &'static str {
        match self {
            Self::Notification(_) => "teak_notif_id",
            Self::DeepLink(_) => "deep_link",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Notification(value) | Self::DeepLink(value) => value,
        }
    }
}

/// A transition that was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// The edge is not in the transition table. The session is now invalid.
    #[error("illegal session transition from {from} to {to}")]
    Illegal {
        /// State the session was in.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// The session was already invalidated by an earlier illegal transition.
    #[error("session {0} is invalid")]
    SessionInvalid(String),
}
