//! Session lifecycle.
//!
//! A [`Session`] is one bounded period of engagement. The
//! [`SessionManager`] keeps exactly one of them current and moves it through
//! the [`SessionState`] table in response to lifecycle, user and remote
//! configuration events.

mod identify;
mod instance;
mod manager;
mod state;

pub use identify::identify_endpoint;
pub use instance::Session;
pub use manager::{ReadyCallback, SessionManager, SessionTransport};
pub use state::{Attribution, SessionState, StateTransitionError};
