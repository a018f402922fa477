//! Driver trait - the boundary between a protocol driver and its consumer

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverResult;
use crate::models::{ChannelConfig, ChannelEvent, ChannelRecord, ValueType};

/// Receives value notifications for a listened channel
///
/// Listeners are identified by the `Arc` they are registered with:
/// unregistering the same `Arc` removes every registration that dispatches
/// to it.
pub trait ChannelListener: Send + Sync {
    fn on_channel_event(&self, event: ChannelEvent);
}

/// Describes the channel a listener wants notifications for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub channel_name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub config: ChannelConfig,
}

impl ListenerConfig {
    pub fn new(
        channel_name: impl Into<String>,
        value_type: ValueType,
        config: ChannelConfig,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            value_type,
            config,
        }
    }
}

/// A read that has been validated once and can be executed repeatedly
#[async_trait]
pub trait PreparedRead: Send + Sync {
    /// Perform the read, updating the held records in place
    async fn execute(&mut self) -> DriverResult<()>;

    /// Records as of the last execution
    fn records(&self) -> &[ChannelRecord];
}

/// A driver for one field device or server
///
/// `read`, `write` and `connect` surface failures as [`DriverError`](crate::DriverError).
/// Listener registration never waits for the device: it returns once the
/// request is recorded and the driver reconciles in the background.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Establish the connection, bounded by the driver's connect timeout
    async fn connect(&self) -> DriverResult<()>;

    /// Drop the connection and abandon any attempt in flight
    async fn disconnect(&self) -> DriverResult<()>;

    /// Read the given channels, connecting first if needed
    ///
    /// Per-channel failures are reported through each record's status; an
    /// `Err` means the request as a whole could not be performed.
    async fn read(&self, records: &mut [ChannelRecord]) -> DriverResult<()>;

    /// Write the given channels, connecting first if needed
    async fn write(&self, records: &mut [ChannelRecord]) -> DriverResult<()>;

    /// Register listeners for channel value changes
    fn register_channel_listeners(
        &self,
        listeners: Vec<(Arc<dyn ChannelListener>, ListenerConfig)>,
    ) -> DriverResult<()>;

    /// Remove every registration dispatching to one of the given listeners
    fn unregister_channel_listeners(
        &self,
        listeners: &[Arc<dyn ChannelListener>],
    ) -> DriverResult<()>;

    /// Validate a set of records once for repeated reads
    fn prepare_read(&self, records: Vec<ChannelRecord>) -> DriverResult<Box<dyn PreparedRead>>;
}
