//! uadrv-opcua - OPC UA channel driver
//!
//! This crate manages one long-lived OPC UA session on behalf of a channel
//! framework: it connects lazily, serializes subscription changes, keeps
//! monitored items in step with registered listeners, and reconnects after
//! transport failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         UaDriver                             │
//! │  Implements Driver trait, owns reconnect policy              │
//! │                                                              │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌─────────────┐ │
//! │  │ ListenerRegistry │  │ ListenerRegistry │  │ Reconnect   │ │
//! │  │ (node listens)   │  │ (tree listens)   │  │ Monitor     │ │
//! │  └────────┬─────────┘  └────────┬─────────┘  └─────────────┘ │
//! │           │ observer            │ observer                   │
//! │  ┌────────┴─────────────────────┴─────────┐                  │
//! │  │           ConnectionManager            │                  │
//! │  │  ┌─────────────────┐ ┌───────────────┐ │                  │
//! │  │  │SubscriptionMgr  │ │SubscriptionMgr│ │                  │
//! │  │  │ + SerialTaskQ   │ │ + SerialTaskQ │ │                  │
//! │  │  └─────────────────┘ └───────────────┘ │                  │
//! │  └───────────────────┬────────────────────┘                  │
//! │                      │                                       │
//! │             ┌────────┴────────┐                              │
//! │             │    UaSession    │                              │
//! │             │ (protocol stack)│                              │
//! │             └─────────────────┘                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod conversion;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod subscription;
pub mod task_queue;
pub mod transport;

pub use config::{OpcuaConfig, TransportConfig, UaDriverOptions};
pub use connection::ConnectionManager;
pub use credentials::{AnonymousCredentials, CredentialProvider, StaticCredentials};
pub use driver::UaDriver;
pub use error::UaDriverError;
pub use monitor::ReconnectMonitor;
pub use registry::{ListenKey, ListenKind, ListenerRegistry};
pub use subscription::{SubscriptionManager, SubscriptionStateKind};
pub use task_queue::SerialTaskQueue;
pub use transport::{create_connector, SessionConnector, TransportError, UaSession};

// Re-export for convenience
pub use uadrv_core::{
    ChannelEvent, ChannelListener, ChannelRecord, Driver, DriverError, DriverResult,
    ListenerConfig, PreparedRead, Value, ValueType,
};
