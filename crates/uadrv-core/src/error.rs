//! Common error types for channel drivers

use std::time::Duration;

use thiserror::Error;

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced to driver callers
///
/// Every internal failure is normalized into one of these variants before it
/// crosses the driver boundary. The type is `Clone` so a single connection
/// failure can be handed to every caller waiting on the same attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// No connection could be established, or the transport rejected the
    /// operation. Carries the root cause.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection attempt was superseded by a disconnect
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// A bounded wait ran out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Channel configuration could not be interpreted by the driver
    #[error("Invalid channel configuration: {0}")]
    InvalidChannel(String),

    /// Operation not supported by this driver
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl DriverError {
    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Connection(_) | DriverError::Cancelled | DriverError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DriverError::Connection("refused".to_string()).is_transient());
        assert!(DriverError::Cancelled.is_transient());
        assert!(DriverError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!DriverError::InvalidChannel("node.id".to_string()).is_transient());
    }

    #[test]
    fn test_connection_error_keeps_root_cause() {
        let err = DriverError::Connection("BadTimeout: no response".to_string());
        assert_eq!(err.to_string(), "Connection error: BadTimeout: no response");
    }
}
