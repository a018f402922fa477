//! OPC UA driver errors

use std::time::Duration;

use thiserror::Error;
use uadrv_core::DriverError;

use crate::channel::ChannelConfigError;
use crate::credentials::CredentialError;
use crate::transport::types::StatusCode;
use crate::transport::TransportError;

/// Internal driver errors
///
/// These never cross the [`Driver`](uadrv_core::Driver) boundary directly;
/// they are normalized into [`DriverError`] first.
#[derive(Debug, Error, Clone)]
pub enum UaDriverError {
    /// Protocol stack or session failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Client identity or server chain validation failed
    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),

    /// Channel configuration could not be parsed
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelConfigError),

    /// Driver options are invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// The server rejected a whole service call
    #[error("{operation} rejected: {status}")]
    BadStatus {
        operation: &'static str,
        status: StatusCode,
    },

    /// The connection attempt was superseded before it completed
    #[error("Connection attempt superseded")]
    Stale,

    /// A service call did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// No session is available
    #[error("Not connected")]
    NotConnected,

    /// A task panicked while running on the serial queue
    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

impl UaDriverError {
    /// Whether this error means the session is unusable
    pub fn is_fatal(&self) -> bool {
        match self {
            UaDriverError::Transport(e) => e.is_fatal(),
            UaDriverError::NotConnected => true,
            _ => false,
        }
    }
}

impl From<UaDriverError> for DriverError {
    fn from(err: UaDriverError) -> Self {
        match err {
            UaDriverError::Stale => DriverError::Cancelled,
            UaDriverError::Timeout(d) => DriverError::Timeout(d),
            UaDriverError::Channel(e) => DriverError::InvalidChannel(e.to_string()),
            other => DriverError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_maps_to_cancelled() {
        let err: DriverError = UaDriverError::Stale.into();
        assert_eq!(err, DriverError::Cancelled);
    }

    #[test]
    fn test_transport_error_keeps_root_cause() {
        let err: DriverError =
            UaDriverError::from(TransportError::ConnectionFailed("refused".into())).into();
        match err {
            DriverError::Connection(msg) => assert!(msg.contains("refused")),
            other => panic!("Expected Connection, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_error_maps_to_invalid_channel() {
        let err: DriverError =
            UaDriverError::from(ChannelConfigError::MissingKey("node.id")).into();
        assert!(matches!(err, DriverError::InvalidChannel(_)));
    }
}
