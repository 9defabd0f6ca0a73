//! Shared helpers for Teak Core integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use teak_core::{
    AppIdentity, DeviceIdentity, HttpTransport, Payload, RequestContext, Response, TransportError,
};
use tokio::time::Instant;

/// One POST seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct Sent {
    pub url: String,
    pub body: Payload,
    pub headers: Vec<(String, String)>,
    pub at: Instant,
}

/// Outcome the transport returns for a request.
pub enum Reply {
    Status(u16, &'static str),
    Fail,
}

/// Transport double that records every request and answers from a script,
/// falling back to a default reply once the script runs out.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    routes: Mutex<Vec<(&'static str, Option<(u16, &'static str)>)>>,
    default_status: u16,
    default_body: &'static str,
    pub sent: Mutex<Vec<Sent>>,
    pub gets: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn always(status: u16) -> Arc<Self> {
        Self::with_default(status, "{}")
    }

    pub fn with_default(status: u16, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            routes: Mutex::new(Vec::new()),
            default_status: status,
            default_body: body,
            sent: Mutex::new(Vec::new()),
            gets: Mutex::new(Vec::new()),
        })
    }

    pub fn scripted(replies: Vec<Reply>, then: u16) -> Arc<Self> {
        let transport = Self::always(then);
        transport.script.lock().unwrap().extend(replies);
        transport
    }

    /// Answer every POST whose URL ends with `suffix`, ahead of the script.
    /// `None` fails the exchange.
    pub fn route(&self, suffix: &'static str, reply: Option<(u16, &'static str)>) {
        self.routes.lock().unwrap().push((suffix, reply));
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, endpoint: &str) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.url.ends_with(endpoint)).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn post(&self, url: &str, body: String, headers: &[(String, String)]) -> Result<Response, TransportError> {
        self.sent.lock().unwrap().push(Sent {
            url: url.to_string(),
            body: serde_json::from_str(&body).unwrap(),
            headers: headers.to_vec(),
            at: Instant::now(),
        });
        let routed = self.routes.lock().unwrap().iter().find(|(suffix, _)| url.ends_with(suffix)).map(|(_, r)| *r);
        if let Some(reply) = routed {
            return reply.map(|(status, body)| Response::new(status, body)).ok_or(TransportError::Closed);
        }
        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Status(status, body)) => Ok(Response::new(status, body)),
            Some(Reply::Fail) => Err(TransportError::Closed),
            None => Ok(Response::new(self.default_status, self.default_body)),
        }
    }

    async fn get(&self, url: &str) -> Result<Response, TransportError> {
        self.gets.lock().unwrap().push(url.to_string());
        Ok(Response::new(200, ""))
    }
}

pub fn app() -> AppIdentity {
    let mut app = AppIdentity::new("1234", "secret");
    app.bundle_id = "io.teak.test".into();
    app.app_version = "1.0".into();
    app
}

pub fn device() -> DeviceIdentity {
    DeviceIdentity {
        device_id: Some("device-1".into()),
        manufacturer: "Acme".into(),
        model: "Phone".into(),
        platform: "android_14".into(),
        ..DeviceIdentity::default()
    }
}

pub fn context() -> RequestContext {
    RequestContext::new(app(), device()).with_user_id("user-1")
}

/// Poll `check` until it holds or five seconds of wall time pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
