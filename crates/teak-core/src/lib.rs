//! Teak Core - session lifecycle and reliable event delivery for the Teak SDK.
//!
//! This crate provides:
//! - [`EventBus`]: ordered delivery of internal events
//! - [`SessionManager`]: the session state machine
//! - [`RequestEngine`]: signed, batched, retried HTTP calls
//! - [`PersistentRequestCache`]: requests that survive process death
//! - [`Teak`]: a facade wiring them together
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use teak_core::{AppIdentity, DeviceIdentity, ReqwestTransport, SdkConfig, Teak};
//!
//! #[tokio::main]
//! async fn main() -> teak_core::Result<()> {
//!     let config = SdkConfig::load("teak.toml".as_ref())?;
//!     let transport = Arc::new(ReqwestTransport::new(&config.transport)?);
//!     let teak = Teak::new(config, AppIdentity::new("1234", "secret"), DeviceIdentity::default(), transport)?;
//!     teak.lifecycle().on_resumed(None);
//!     teak.identify_user("user-1");
//!     teak.track_event("Played", Some("Level"), Some("1"));
//!     teak.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod request;
pub mod sdk;
pub mod session;
pub mod storage;
mod sync;

pub use config::{
    AppIdentity, BatchPolicy, DeviceIdentity, EndpointPolicy, PolicyError, RemoteConfiguration, RetryPolicy,
    SdkConfig,
};
pub use error::{Result, TeakError};
pub use events::{EventBus, EventListener, LifecycleEvent, ListenerId, TeakEvent};
pub use request::{
    HttpTransport, Payload, Request, RequestContext, RequestEngine, ReqwestTransport, Response, ResponseCallback,
    TransportError,
};
pub use sdk::{LifecycleAdapter, Teak};
pub use session::{Attribution, Session, SessionManager, SessionState, SessionTransport, StateTransitionError};
pub use storage::{CacheDatabase, CachedRequestRecord, PersistentRequestCache, StorageError};
