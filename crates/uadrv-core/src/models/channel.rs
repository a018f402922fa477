//! Channel records exchanged with a driver

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::{Value, ValueType};

/// Driver-specific channel configuration (key/value pairs)
pub type ChannelConfig = BTreeMap<String, String>;

/// Outcome flag of the last operation on a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFlag {
    Success,
    Failure,
}

/// Status attached to a record after a read, write or notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub flag: ChannelFlag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChannelStatus {
    pub fn success() -> Self {
        Self {
            flag: ChannelFlag::Success,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            flag: ChannelFlag::Failure,
            message: Some(message.into()),
        }
    }
}

/// A single channel read/write request and its result
///
/// For reads, the driver fills in `value`, `status` and `timestamp`.
/// For writes, `value` holds the value to write and the driver fills in
/// `status` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Channel name as known to the consumer
    pub channel_name: String,
    /// Type the consumer expects the value in
    pub value_type: ValueType,
    /// Driver-specific addressing
    #[serde(default)]
    pub config: ChannelConfig,
    /// Value read from, or to be written to, the channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Outcome of the last operation
    pub status: ChannelStatus,
    /// When the outcome was recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChannelRecord {
    /// Create a record describing a read
    pub fn read(
        channel_name: impl Into<String>,
        value_type: ValueType,
        config: ChannelConfig,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            value_type,
            config,
            value: None,
            status: ChannelStatus::success(),
            timestamp: None,
        }
    }

    /// Create a record describing a write
    pub fn write(channel_name: impl Into<String>, value: Value, config: ChannelConfig) -> Self {
        Self {
            channel_name: channel_name.into(),
            value_type: value.value_type(),
            config,
            value: Some(value),
            status: ChannelStatus::success(),
            timestamp: None,
        }
    }

    /// Store a successfully obtained value
    pub fn set_value(&mut self, value: Value) {
        self.value = Some(value);
        self.status = ChannelStatus::success();
        self.timestamp = Some(Utc::now());
    }

    /// Mark the last operation successful without changing the value
    pub fn set_success(&mut self) {
        self.status = ChannelStatus::success();
        self.timestamp = Some(Utc::now());
    }

    /// Mark the last operation failed
    pub fn set_failure(&mut self, message: impl Into<String>) {
        self.status = ChannelStatus::failure(message);
        self.timestamp = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status.flag == ChannelFlag::Success
    }
}

/// Notification delivered to a channel listener
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub record: ChannelRecord,
}

impl ChannelEvent {
    pub fn new(record: ChannelRecord) -> Self {
        Self { record }
    }

    pub fn channel_name(&self) -> &str {
        &self.record.channel_name
    }
}
