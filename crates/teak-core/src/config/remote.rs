//! Server-provided configuration snapshot.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use super::policy::{EndpointPolicy, RawEndpointPolicy};
use crate::request::Payload;

/// Heartbeat interval used when the server does not specify one.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Immutable remote configuration snapshot.
///
/// Components hold it behind an `Arc` and swap the whole snapshot when a new
/// one arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfiguration {
    /// Host that receives API calls.
    pub hostname: String,
    /// Key/values merged into every request payload.
    pub dynamic_parameters: Payload,
    /// Interval between heartbeats once a user is identified.
    pub heartbeat_interval: Duration,
    endpoint_policies: HashMap<String, HashMap<String, EndpointPolicy>>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsResponse {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    endpoint_configurations: HashMap<String, HashMap<String, serde_json::Value>>,
    #[serde(default)]
    dynamic_common_payload: Payload,
    #[serde(default)]
    heartbeat_interval: Option<f64>,
}

impl RemoteConfiguration {
    /// Snapshot with no endpoint policies.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            dynamic_parameters: Payload::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            endpoint_policies: HashMap::new(),
        }
    }

    /// Add or replace the policy for one endpoint.
    #[must_use]
    pub fn with_endpoint_policy(
        mut self,
        hostname: impl Into<String>,
        endpoint: impl Into<String>,
        policy: EndpointPolicy,
    ) -> Self {
        self.endpoint_policies.entry(hostname.into()).or_default().insert(endpoint.into(), policy);
        self
    }

    /// Replace the dynamic parameters.
    #[must_use]
    pub fn with_dynamic_parameters(mut self, parameters: Payload) -> Self {
        self.dynamic_parameters = parameters;
        self
    }

    /// Replace the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Policy for `(hostname, endpoint)`; defaults when none is configured.
    pub fn policy_for(&self, hostname: &str, endpoint: &str) -> EndpointPolicy {
        self.endpoint_policies
            .get(hostname)
            .and_then(|endpoints| endpoints.get(endpoint))
            .cloned()
            .unwrap_or_default()
    }

    /// Parse the body of `/games/{app_id}/settings.json`.
    ///
    /// An empty body yields a snapshot pointing at `default_hostname`. Endpoint
    /// policies that fail validation are logged and fall back to defaults.
    pub fn from_settings_json(body: &str, default_hostname: &str) -> Result<Self, serde_json::Error> {
        let response: SettingsResponse =
            if body.trim().is_empty() { SettingsResponse::default() } else { serde_json::from_str(body)? };

        let hostname = response
            .auth
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| default_hostname.to_string());

        let mut endpoint_policies: HashMap<String, HashMap<String, EndpointPolicy>> = HashMap::new();
        for (host, endpoints) in response.endpoint_configurations {
            for (endpoint, value) in endpoints {
                let parsed = serde_json::from_value::<RawEndpointPolicy>(value)
                    .map_err(|e| e.to_string())
                    .and_then(|raw| EndpointPolicy::try_from(raw).map_err(|e| e.to_string()));
                match parsed {
                    Ok(policy) => {
                        endpoint_policies.entry(host.clone()).or_default().insert(endpoint, policy);
                    }
                    Err(error) => {
                        warn!(hostname = %host, endpoint = %endpoint, error = %error, "Ignoring invalid endpoint policy");
                    }
                }
            }
        }

        let heartbeat_interval = response
            .heartbeat_interval
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map_or(DEFAULT_HEARTBEAT_INTERVAL, Duration::from_secs_f64);

        Ok(Self {
            hostname,
            dynamic_parameters: response.dynamic_common_payload,
            heartbeat_interval,
            endpoint_policies,
        })
    }
}
