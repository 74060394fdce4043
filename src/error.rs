//! Error types for lanwatch.

use thiserror::Error;

/// Failures of a discovery provider.
///
/// All of these are recoverable: the scan loop treats them as a cycle in which
/// nothing answered.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Permission denied opening capture channel: {0}")]
    PermissionDenied(String),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error("Discovery method not supported here: {0}")]
    Unsupported(String),

    #[error("Capture channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiscoveryError {
    /// Whether a different discovery method may still succeed.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            DiscoveryError::PermissionDenied(_)
                | DiscoveryError::Interface(_)
                | DiscoveryError::Unsupported(_)
        )
    }
}

/// Presence store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Invalid note: {0}")]
    InvalidNote(String),

    #[error("Corrupt row for {key}: {message}")]
    Corrupt { key: String, message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },

    #[error("No usable network interface: {0}")]
    NoInterface(String),
}

/// The broadcast hub task is gone.
#[derive(Debug, Error)]
#[error("Broadcast hub has shut down")]
pub struct HubClosed;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fallback_classification() {
        assert!(DiscoveryError::PermissionDenied("raw socket".into()).allows_fallback());
        assert!(DiscoveryError::Unsupported("not linux".into()).allows_fallback());
        assert!(!DiscoveryError::Timeout(Duration::from_secs(3)).allows_fallback());
        assert!(!DiscoveryError::Channel("closed".into()).allows_fallback());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("aa:bb:cc:dd:ee:ff".to_string());
        assert_eq!(format!("{}", err), "Device not found: aa:bb:cc:dd:ee:ff");
    }
}
