//! Error types for Teak Core.

use crate::config::PolicyError;
use crate::request::TransportError;
use crate::session::StateTransitionError;
use crate::storage::StorageError;
use thiserror::Error;

/// Core error type for Teak operations.
#[derive(Error, Debug)]
pub enum TeakError {
    /// Missing or malformed configuration (identity, config file).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Illegal session state transition.
    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    /// Non-HTTP transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid retry or batch policy.
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Config file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Teak operations.
pub type Result<T> = std::result::Result<T, TeakError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[test]
    fn test_teak_error_storage_conversion() {
        let teak_err: TeakError = StorageError::Closed.into();
        match teak_err {
            TeakError::Storage(StorageError::Closed) => {
                assert_eq!(teak_err.to_string(), "Storage error: Database is closed");
            }
            _ => panic!("Expected Storage error variant"),
        }
    }

    #[test]
    fn test_teak_error_transition_conversion() {
        let err = StateTransitionError::Illegal {
            from: SessionState::Allocated,
            to: SessionState::Expired,
        };
        let teak_err: TeakError = err.into();
        let msg = teak_err.to_string();
        assert!(msg.contains("State transition error"));
        assert!(msg.contains("Allocated"));
        assert!(msg.contains("Expired"));
    }

    #[test]
    fn test_teak_error_config() {
        let err = TeakError::Config("missing app_id".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("Configuration error"));
        assert!(msg.contains("missing app_id"));
    }

    #[test]
    fn test_teak_error_toml() {
        let toml_err = toml::from_str::<crate::config::SdkConfig>("session = 5").unwrap_err();
        let teak_err: TeakError = toml_err.into();
        assert!(matches!(teak_err, TeakError::ConfigParse(_)));
    }

    #[test]
    fn test_teak_error_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let teak_err: TeakError = io_err.into();
        match teak_err {
            TeakError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_teak_error_from_storage_connection() {
        let db_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        let storage_err = StorageError::Connection(db_err);
        let teak_err: TeakError = storage_err.into();
        match teak_err {
            TeakError::Storage(StorageError::Connection(_)) => {}
            _ => panic!("Expected Storage::Connection"),
        }
    }
}
