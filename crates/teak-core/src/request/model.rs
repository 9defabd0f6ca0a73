//! Outbound request value and the identity it is built from.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::Payload;
use crate::config::{AppIdentity, DeviceIdentity, RemoteConfiguration, SDK_VERSION};

/// Hostname used before any remote configuration is known.
pub const DEFAULT_HOSTNAME: &str = "gocarrot.com";

/// Who is making a request: app, device, user and current remote snapshot.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Host application identity.
    pub app: AppIdentity,
    /// Device identity.
    pub device: DeviceIdentity,
    /// Identified user, if any.
    pub user_id: Option<String>,
    /// Remote configuration snapshot, once fetched.
    pub remote: Option<Arc<RemoteConfiguration>>,
}

impl RequestContext {
    /// Context without a user or remote configuration.
    pub fn new(app: AppIdentity, device: DeviceIdentity) -> Self {
        Self { app, device, user_id: None, remote: None }
    }

    /// Set the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the remote configuration snapshot.
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<RemoteConfiguration>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Host that receives API calls.
    pub fn hostname(&self) -> &str {
        self.remote.as_ref().map_or(DEFAULT_HOSTNAME, |r| r.hostname.as_str())
    }

    /// Standard attributes added to every payload.
    pub fn identity_attributes(&self) -> Payload {
        let mut attributes = Payload::new();
        if let Some(user_id) = &self.user_id {
            attributes.insert("api_key".into(), Value::from(user_id.as_str()));
        }
        attributes.insert("request_date".into(), Value::from(Utc::now().timestamp()));
        attributes.insert("game_id".into(), Value::from(self.app.app_id.as_str()));
        attributes.insert("sdk_version".into(), Value::from(SDK_VERSION));
        attributes.insert("sdk_platform".into(), Value::from(self.device.platform.as_str()));
        attributes.insert("app_version".into(), Value::from(self.app.app_version.as_str()));
        attributes.insert("bundle_id".into(), Value::from(self.app.bundle_id.as_str()));
        if let Some(store) = &self.app.installer_package {
            attributes.insert("appstore_name".into(), Value::from(store.as_str()));
        }
        if let Some(device_id) = &self.device.device_id {
            attributes.insert("device_id".into(), Value::from(device_id.as_str()));
        }
        attributes.insert("device_manufacturer".into(), Value::from(self.device.manufacturer.as_str()));
        attributes.insert("device_model".into(), Value::from(self.device.model.as_str()));
        attributes
    }
}

/// One outbound call.
///
/// The `sent` flag only ever goes from false to true. The retry index
/// advances by one for every retry the engine schedules.
#[derive(Debug)]
pub struct Request {
    request_id: String,
    hostname: String,
    method: &'static str,
    endpoint: String,
    payload: Payload,
    secret: String,
    sent: AtomicBool,
    retry_index: AtomicUsize,
}

impl Request {
    /// Build a request with the identity attributes and dynamic parameters
    /// merged into `payload`.
    ///
    /// Identity attributes overwrite caller keys. Dynamic parameters only
    /// fill keys that are still absent.
    pub fn new(context: &RequestContext, endpoint: impl Into<String>, payload: Payload) -> Self {
        let mut merged = payload;
        merged.extend(context.identity_attributes());
        if let Some(remote) = &context.remote {
            for (key, value) in &remote.dynamic_parameters {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Self::raw(context, endpoint, merged)
    }

    /// Build a request that sends `payload` exactly as given.
    pub fn raw(context: &RequestContext, endpoint: impl Into<String>, payload: Payload) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            hostname: context.hostname().to_string(),
            method: "POST",
            endpoint: endpoint.into(),
            payload,
            secret: context.app.api_key.clone(),
            sent: AtomicBool::new(false),
            retry_index: AtomicUsize::new(0),
        }
    }

    /// Send to a different host.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Reuse an existing id, e.g. when replaying a cached request.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }

    /// Full URL for `scheme`.
    pub fn url(&self, scheme: &str) -> String {
        format!("{scheme}://{}{}", self.hostname, self.endpoint)
    }

    /// JSON body.
    pub fn body(&self) -> String {
        Value::Object(self.payload.clone()).to_string()
    }

    /// Whether the request has been handed to the transport.
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    pub(crate) fn mark_sent(&self) {
        self.sent.store(true, Ordering::Release);
    }

    /// Number of retries already scheduled.
    pub fn retry_index(&self) -> usize {
        self.retry_index.load(Ordering::Acquire)
    }

    pub(crate) fn advance_retry(&self) -> usize {
        self.retry_index.fetch_add(1, Ordering::AcqRel)
    }
}
