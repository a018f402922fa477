//! Protocol-level types exchanged with the session layer

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Server-assigned subscription identifier
pub type SubscriptionId = u32;

/// Server-assigned monitored item identifier
pub type MonitoredItemId = u32;

/// Client-assigned handle echoed back in notifications
pub type ClientHandle = u32;

// =============================================================================
// NodeId
// =============================================================================

/// Identifier part of a node id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Numeric(u32),
    String(String),
}

/// OPC UA node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: Identifier,
}

impl NodeId {
    pub fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(value.into()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            Identifier::Numeric(v) => write!(f, "i={}", v),
            Identifier::String(v) => write!(f, "s={}", v),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid node id: {0}")]
pub struct InvalidNodeId(pub String);

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    /// Parses `ns=<n>;i=<num>`, `ns=<n>;s=<text>`, or the same without the
    /// namespace part (namespace 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidNodeId(s.to_string());
        let trimmed = s.trim();

        let (namespace, rest) = match trimmed.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest.split_once(';').ok_or_else(invalid)?;
                (ns.parse::<u16>().map_err(|_| invalid())?, id)
            }
            None => (0, trimmed),
        };

        if let Some(num) = rest.strip_prefix("i=") {
            let value = num.parse::<u32>().map_err(|_| invalid())?;
            Ok(NodeId::numeric(namespace, value))
        } else if let Some(text) = rest.strip_prefix("s=") {
            if text.is_empty() {
                return Err(invalid());
            }
            Ok(NodeId::string(namespace, text))
        } else {
            Err(invalid())
        }
    }
}

// =============================================================================
// AttributeId
// =============================================================================

/// Node attributes a channel may address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeId {
    NodeId = 1,
    BrowseName = 3,
    DisplayName = 4,
    EventNotifier = 12,
    Value = 13,
    DataType = 14,
}

impl Default for AttributeId {
    fn default() -> Self {
        Self::Value
    }
}

impl FromStr for AttributeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nodeid" => Ok(AttributeId::NodeId),
            "browsename" => Ok(AttributeId::BrowseName),
            "displayname" => Ok(AttributeId::DisplayName),
            "eventnotifier" => Ok(AttributeId::EventNotifier),
            "value" => Ok(AttributeId::Value),
            "datatype" => Ok(AttributeId::DataType),
            other => Err(other.to_string()),
        }
    }
}

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA status code (severity in the top two bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SERVER_NOT_CONNECTED: StatusCode = StatusCode(0x800D_0000);
    pub const BAD_SESSION_ID_INVALID: StatusCode = StatusCode(0x8025_0000);
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    pub const BAD_SUBSCRIPTION_ID_INVALID: StatusCode = StatusCode(0x8028_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_ATTRIBUTE_ID_INVALID: StatusCode = StatusCode(0x8035_0000);
    pub const BAD_NOT_WRITABLE: StatusCode = StatusCode(0x803B_0000);
    pub const BAD_MONITORED_ITEM_ID_INVALID: StatusCode = StatusCode(0x8042_0000);
    pub const BAD_TYPE_MISMATCH: StatusCode = StatusCode(0x8074_0000);
    pub const BAD_SECURE_CHANNEL_CLOSED: StatusCode = StatusCode(0x8086_0000);
    pub const BAD_NOT_CONNECTED: StatusCode = StatusCode(0x808A_0000);
    pub const BAD_CONNECTION_CLOSED: StatusCode = StatusCode(0x80AE_0000);

    #[inline]
    pub fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    #[inline]
    pub fn is_uncertain(&self) -> bool {
        self.0 & 0xC000_0000 == 0x4000_0000
    }

    #[inline]
    pub fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Whether the code says the session or channel underneath is gone
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            StatusCode(self.0 & 0xFFFF_0000),
            StatusCode::BAD_SERVER_NOT_CONNECTED
                | StatusCode::BAD_SESSION_ID_INVALID
                | StatusCode::BAD_SESSION_CLOSED
                | StatusCode::BAD_SECURE_CHANNEL_CLOSED
                | StatusCode::BAD_NOT_CONNECTED
                | StatusCode::BAD_CONNECTION_CLOSED
        )
    }

    fn name(&self) -> Option<&'static str> {
        let name = match *self {
            StatusCode::GOOD => "Good",
            StatusCode::BAD_UNEXPECTED_ERROR => "BadUnexpectedError",
            StatusCode::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            StatusCode::BAD_TIMEOUT => "BadTimeout",
            StatusCode::BAD_SUBSCRIPTION_ID_INVALID => "BadSubscriptionIdInvalid",
            StatusCode::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            StatusCode::BAD_ATTRIBUTE_ID_INVALID => "BadAttributeIdInvalid",
            StatusCode::BAD_NOT_WRITABLE => "BadNotWritable",
            StatusCode::BAD_MONITORED_ITEM_ID_INVALID => "BadMonitoredItemIdInvalid",
            StatusCode::BAD_TYPE_MISMATCH => "BadTypeMismatch",
            StatusCode::BAD_SERVER_NOT_CONNECTED => "BadServerNotConnected",
            StatusCode::BAD_SESSION_ID_INVALID => "BadSessionIdInvalid",
            StatusCode::BAD_SESSION_CLOSED => "BadSessionClosed",
            StatusCode::BAD_SECURE_CHANNEL_CLOSED => "BadSecureChannelClosed",
            StatusCode::BAD_NOT_CONNECTED => "BadNotConnected",
            StatusCode::BAD_CONNECTION_CLOSED => "BadConnectionClosed",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08X})", name, self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

// =============================================================================
// Variant / DataValue
// =============================================================================

/// Value as carried by the protocol stack
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Empty,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    ByteString(Vec<u8>),
    LocalizedText(String),
    DateTime(DateTime<Utc>),
    NodeId(Box<NodeId>),
}

impl Variant {
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Empty => "Empty",
            Variant::Boolean(_) => "Boolean",
            Variant::SByte(_) => "SByte",
            Variant::Byte(_) => "Byte",
            Variant::Int16(_) => "Int16",
            Variant::UInt16(_) => "UInt16",
            Variant::Int32(_) => "Int32",
            Variant::UInt32(_) => "UInt32",
            Variant::Int64(_) => "Int64",
            Variant::UInt64(_) => "UInt64",
            Variant::Float(_) => "Float",
            Variant::Double(_) => "Double",
            Variant::String(_) => "String",
            Variant::ByteString(_) => "ByteString",
            Variant::LocalizedText(_) => "LocalizedText",
            Variant::DateTime(_) => "DateTime",
            Variant::NodeId(_) => "NodeId",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Empty => Ok(()),
            Variant::Boolean(v) => write!(f, "{}", v),
            Variant::SByte(v) => write!(f, "{}", v),
            Variant::Byte(v) => write!(f, "{}", v),
            Variant::Int16(v) => write!(f, "{}", v),
            Variant::UInt16(v) => write!(f, "{}", v),
            Variant::Int32(v) => write!(f, "{}", v),
            Variant::UInt32(v) => write!(f, "{}", v),
            Variant::Int64(v) => write!(f, "{}", v),
            Variant::UInt64(v) => write!(f, "{}", v),
            Variant::Float(v) => write!(f, "{}", v),
            Variant::Double(v) => write!(f, "{}", v),
            Variant::String(v) | Variant::LocalizedText(v) => f.write_str(v),
            Variant::ByteString(v) => f.write_str(&hex::encode(v)),
            Variant::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Variant::NodeId(v) => write!(f, "{}", v),
        }
    }
}

/// A value with status and timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    pub fn good(value: Variant) -> Self {
        Self {
            value,
            status: StatusCode::GOOD,
            source_timestamp: None,
            server_timestamp: Some(Utc::now()),
        }
    }

    pub fn bad(status: StatusCode) -> Self {
        Self {
            value: Variant::Empty,
            status,
            source_timestamp: None,
            server_timestamp: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Service request/response types
// =============================================================================

/// Node attribute to read or monitor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadValueId {
    pub node_id: NodeId,
    pub attribute: AttributeId,
}

/// Node attribute and value to write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteValue {
    pub node_id: NodeId,
    pub attribute: AttributeId,
    pub value: Variant,
}

/// Parameters for a new subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionParams {
    pub publishing_interval: Duration,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub priority: u8,
}

impl SubscriptionParams {
    pub fn with_publishing_interval(publishing_interval: Duration) -> Self {
        Self {
            publishing_interval,
            lifetime_count: 60,
            max_keep_alive_count: 20,
            priority: 0,
        }
    }
}

/// Request to create one monitored item
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateRequest {
    pub item_to_monitor: ReadValueId,
    pub client_handle: ClientHandle,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

/// Server result for one monitored item creation
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateResult {
    pub status: StatusCode,
    pub monitored_item_id: MonitoredItemId,
    pub revised_sampling_interval: Duration,
}

/// Asynchronous notifications published by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Sampled value for a monitored node attribute
    DataChange {
        subscription_id: SubscriptionId,
        client_handle: ClientHandle,
        value: DataValue,
    },
    /// Event raised below a monitored event notifier
    Event {
        subscription_id: SubscriptionId,
        client_handle: ClientHandle,
        source_node: NodeId,
        value: DataValue,
    },
    /// The server stopped servicing a monitored item
    MonitoredItemInvalidated {
        subscription_id: SubscriptionId,
        client_handle: ClientHandle,
        status: StatusCode,
    },
    /// A subscription could not be carried over to a reactivated session
    SubscriptionTransferFailed { subscription_id: SubscriptionId },
    /// The session is gone and will not recover by itself
    ConnectionLost { reason: String },
}
