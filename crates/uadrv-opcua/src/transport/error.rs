//! Transport layer errors

use thiserror::Error;

use super::types::StatusCode;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Service {service} failed: {status}")]
    ServiceFault {
        service: &'static str,
        status: StatusCode,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),

    #[error("Security error: {0}")]
    Security(String),
}

impl TransportError {
    /// Whether the session behind the failing call can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed | TransportError::ConnectionFailed(_)
        )
    }
}
