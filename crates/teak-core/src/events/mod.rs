//! Internal event bus connecting the SDK components.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{EventListener, LifecycleEvent, ListenerId, TeakEvent};
