//! uadrv-core - Core traits and types for channel drivers
//!
//! This crate provides the boundary between a protocol driver and the
//! framework that consumes it: channel records, typed values, listeners,
//! and the single error type surfaced to driver callers.

pub mod driver;
pub mod error;
pub mod models;

pub use driver::{ChannelListener, Driver, ListenerConfig, PreparedRead};
pub use error::{DriverError, DriverResult};
pub use models::*;
