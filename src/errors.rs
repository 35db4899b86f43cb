//! Crate-level error taxonomy

use thiserror::Error;

use crate::bus::transport::TransportError;
use crate::outbox::OutboxError;
use crate::settings::ConfigurationError;
use crate::storage::StorageError;

/// Top-level error for platform assembly and the services built on it.
///
/// Startup distinguishes two fatal classes: invalid settings
/// ([`PlatformError::Configuration`]) and an unreachable backend at selection
/// time ([`PlatformError::BackendUnavailable`]). Everything after startup
/// surfaces as the typed error of the component that failed.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Startup settings are invalid or incomplete
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A selected backend did not answer the eager connectivity probe
    #[error("Backend unavailable: {backend}: {reason}")]
    BackendUnavailable {
        /// Which backend failed the probe
        backend: &'static str,
        /// Probe failure detail
        reason: String,
    },

    /// Telemetry write or query failure after retry exhaustion
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Outbox store failure
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Event transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

impl PlatformError {
    /// Whether this error is fatal at startup (the process must not serve
    /// traffic)
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            PlatformError::Configuration(_) | PlatformError::BackendUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_fatal_classification() {
        let err = PlatformError::BackendUnavailable {
            backend: "postgres",
            reason: "connection refused".to_string(),
        };
        assert!(err.is_startup_fatal());
        assert_eq!(
            err.to_string(),
            "Backend unavailable: postgres: connection refused"
        );

        let err = PlatformError::Storage(StorageError::Backend("boom".to_string()));
        assert!(!err.is_startup_fatal());
    }
}
