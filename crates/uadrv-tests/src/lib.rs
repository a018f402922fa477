//! Integration tests for the OPC UA channel driver
//!
//! Every test drives a [`UaDriver`] over the in-process mock server, so no
//! network or external OPC UA server is needed.
//!
//! # Test Structure
//!
//! - `task_queue_test.rs` - serial execution and FIFO order
//! - `connection_test.rs` - shared connects, stale attempts, reconnection
//! - `subscription_test.rs` - listener registration and reconciliation
//! - `read_write_test.rs` - reads, writes and prepared reads
//!
//! This module holds the helpers shared by those files.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uadrv_core::{ChannelConfig, ChannelEvent, ChannelListener, ListenerConfig, Value, ValueType};
use uadrv_opcua::channel;
use uadrv_opcua::config::MockConfig;
use uadrv_opcua::transport::mock::MockConnector;
use uadrv_opcua::transport::types::NodeId;
use uadrv_opcua::{AnonymousCredentials, UaDriver, UaDriverOptions};

/// Listener that keeps every event it receives
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ChannelEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Values delivered for one channel, oldest first
    pub fn values_for(&self, channel_name: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.channel_name() == channel_name)
            .filter_map(|e| e.record.value.clone())
            .collect()
    }
}

impl ChannelListener for RecordingListener {
    fn on_channel_event(&self, event: ChannelEvent) {
        self.events.lock().push(event);
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Options with short timers so reconnect paths finish quickly
pub fn fast_options() -> UaDriverOptions {
    UaDriverOptions {
        endpoint_url: "opc.tcp://mock:4840".to_string(),
        request_timeout_ms: 2_000,
        connect_timeout_ms: 2_000,
        reconnect_interval_ms: 50,
        publish_interval_ms: 100,
        ..Default::default()
    }
}

/// A driver over a fresh mock server
pub fn mock_driver(options: UaDriverOptions) -> (UaDriver, MockConnector) {
    mock_driver_with(options, MockConfig::default())
}

/// A driver over a fresh mock server with custom latencies
pub fn mock_driver_with(options: UaDriverOptions, mock: MockConfig) -> (UaDriver, MockConnector) {
    let connector = MockConnector::new(&mock);
    let driver = UaDriver::new(
        options,
        Arc::new(connector.clone()),
        Arc::new(AnonymousCredentials),
    )
    .expect("driver options are valid");
    (driver, connector)
}

/// Node in the demo namespace
pub fn node(name: &str) -> NodeId {
    NodeId::string(2, name)
}

/// Channel config addressing a node in the demo namespace
pub fn node_channel(name: &str) -> ChannelConfig {
    ChannelConfig::from([(channel::NODE_ID.to_string(), node(name).to_string())])
}

/// Channel config listening with an explicit sampling interval
pub fn sampled_channel(name: &str, sampling_ms: u64) -> ChannelConfig {
    let mut config = node_channel(name);
    config.insert(channel::SAMPLING_INTERVAL.to_string(), sampling_ms.to_string());
    config
}

/// Channel config listening to events below a root node
pub fn tree_channel(root: &str) -> ChannelConfig {
    let mut config = node_channel(root);
    config.insert(channel::SUBSCRIBE_TO_CHILDREN.to_string(), "true".to_string());
    config
}

/// One registration entry for `register_channel_listeners`
pub fn listen(
    listener: &Arc<RecordingListener>,
    channel_name: &str,
    value_type: ValueType,
    config: ChannelConfig,
) -> (Arc<dyn ChannelListener>, ListenerConfig) {
    let listener: Arc<dyn ChannelListener> = listener.clone();
    (listener, ListenerConfig::new(channel_name, value_type, config))
}
