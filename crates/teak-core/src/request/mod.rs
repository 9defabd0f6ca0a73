//! Outbound request pipeline.
//!
//! [`RequestEngine`] resolves per-endpoint policy from the remote
//! configuration, batches payloads where configured, signs each request and
//! sends it through an [`HttpTransport`], retrying server errors.

mod batch;
mod engine;
mod model;
mod scheduler;
pub mod signing;
mod transport;

/// JSON object sent as a request body.
pub type Payload = serde_json::Map<String, serde_json::Value>;

pub use engine::{RequestEngine, ResponseCallback, TRACK_EVENT_ENDPOINT};
pub use model::{DEFAULT_HOSTNAME, Request, RequestContext};
pub use transport::{HttpTransport, ReqwestTransport, Response, TransportError};
