//! HTTP transport seam.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::Payload;
use crate::config::TransportConfig;

/// Failure to complete an HTTP exchange at all.
///
/// Non-2xx statuses are not errors; they arrive as a [`Response`].
#[derive(Error, Debug)]
pub enum TransportError {
    /// The HTTP client failed (DNS, TLS, connection reset, timeout).
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The signing key was rejected by the MAC implementation.
    #[error("Invalid signing key: {0}")]
    Signing(String),

    /// The payload could not be encoded.
    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine was shut down before the request ran.
    #[error("Transport closed")]
    Closed,
}

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

impl Response {
    /// Create a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into() }
    }

    /// True for server errors, which the retry policy may repeat.
    pub fn is_retryable(&self) -> bool {
        self.status >= 500
    }

    /// Body parsed as a JSON object, if it is one.
    pub fn json(&self) -> Option<Payload> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Performs HTTP exchanges for the engine.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST a JSON body with the given extra headers.
    async fn post(&self, url: &str, body: String, headers: &[(String, String)]) -> Result<Response, TransportError>;

    /// Plain GET.
    async fn get(&self, url: &str) -> Result<Response, TransportError>;
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client honoring the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().user_agent(concat!("teak-core/", env!("CARGO_PKG_VERSION")));
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self { client: builder.build()? })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, url: &str, body: String, headers: &[(String, String)]) -> Result<Response, TransportError> {
        let mut request = self.client.post(url).header(reqwest::header::CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.body(body).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(url = %url, status, "POST completed");
        Ok(Response { status, body })
    }

    async fn get(&self, url: &str) -> Result<Response, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(url = %url, status, "GET completed");
        Ok(Response { status, body })
    }
}
