//! App and device identity supplied by the host application.

use serde::{Deserialize, Serialize};

use crate::error::TeakError;

/// Version string reported in every request payload.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity of the host application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    /// Teak app id.
    pub app_id: String,
    /// Secret used to sign requests.
    pub api_key: String,
    /// Platform bundle identifier.
    #[serde(default)]
    pub bundle_id: String,
    /// App version string.
    #[serde(default)]
    pub app_version: String,
    /// Store the app was installed from, if known.
    #[serde(default)]
    pub installer_package: Option<String>,
}

impl AppIdentity {
    /// Create an identity with the two required fields.
    pub fn new(app_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { app_id: app_id.into(), api_key: api_key.into(), ..Self::default() }
    }

    /// Checks that the fields required to start the SDK are present.
    ///
    /// # Errors
    ///
    /// Returns `TeakError::Config` naming the first missing field.
    pub fn validate(&self) -> Result<(), TeakError> {
        if self.app_id.trim().is_empty() {
            return Err(TeakError::Config("app_id is required".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(TeakError::Config("api_key is required".to_string()));
        }
        Ok(())
    }
}

/// Identity of the device the SDK runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable device identifier.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Push registration token.
    #[serde(default)]
    pub push_token: Option<String>,
    /// Advertising identifier.
    #[serde(default)]
    pub advertising_id: Option<String>,
    /// Whether the user limited ad tracking.
    #[serde(default)]
    pub limit_ad_tracking: bool,
    /// Device manufacturer.
    #[serde(default)]
    pub manufacturer: String,
    /// Device model.
    #[serde(default)]
    pub model: String,
    /// Platform string, e.g. `android_14`.
    #[serde(default = "default_platform")]
    pub platform: String,
    /// User locale, e.g. `en_US`.
    #[serde(default)]
    pub locale: Option<String>,
}

fn default_platform() -> String {
    "unknown".to_string()
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            device_id: None,
            push_token: None,
            advertising_id: None,
            limit_ad_tracking: false,
            manufacturer: String::new(),
            model: String::new(),
            platform: default_platform(),
            locale: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_app_id() {
        let identity = AppIdentity::new("", "secret");
        let err = identity.validate().unwrap_err();
        assert!(err.to_string().contains("app_id"));
    }

    #[test]
    fn test_validate_requires_api_key() {
        let identity = AppIdentity::new("1234", "  ");
        let err = identity.validate().unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_validate_ok() {
        assert!(AppIdentity::new("1234", "secret").validate().is_ok());
    }

    #[test]
    fn test_device_identity_deserialize_defaults() {
        let device: DeviceIdentity = serde_json::from_str(r#"{"device_id": "abc"}"#).unwrap();
        assert_eq!(device.device_id.as_deref(), Some("abc"));
        assert_eq!(device.platform, "unknown");
        assert!(!device.limit_ad_tracking);
    }
}
