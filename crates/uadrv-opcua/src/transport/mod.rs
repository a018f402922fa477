//! Transport seam between the driver and an OPC UA protocol stack
//!
//! The driver never encodes protocol messages itself. It talks to a
//! [`SessionConnector`] that opens [`UaSession`]s, and each session exposes
//! the batched services the driver needs (read, write, subscriptions and
//! monitored items) plus a broadcast stream of [`SessionEvent`]s.
//!
//! Connectors:
//! - OPC UA client stack (behind the `opcua` feature)
//! - Mock connector simulating a server in-process
//!
//! # Example
//!
//! ```ignore
//! use uadrv_opcua::transport::create_connector;
//! use uadrv_opcua::config::{TransportConfig, UaDriverOptions};
//!
//! let connector = create_connector(&TransportConfig::default())?;
//! let session = connector.connect(&UaDriverOptions::default(), None).await?;
//! let values = session.read(&nodes).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;
pub mod types;

#[cfg(feature = "opcua")]
pub mod opcua;

pub use adapter::{SessionConnector, UaSession};
pub use error::TransportError;
pub use types::SessionEvent;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a session connector based on configuration
pub fn create_connector(
    config: &TransportConfig,
) -> Result<Arc<dyn SessionConnector>, TransportError> {
    match config {
        #[cfg(feature = "opcua")]
        TransportConfig::Opcua(cfg) => Ok(Arc::new(opcua::OpcuaConnector::new(cfg))),
        #[cfg(not(feature = "opcua"))]
        TransportConfig::Opcua(_) => Err(TransportError::Unsupported(
            "OPC UA client requires the 'opcua' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockConnector::new(cfg))),
    }
}
