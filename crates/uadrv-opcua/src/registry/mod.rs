//! Listener registrations and their identifying keys
//!
//! A registration is identified by its [`ListenKey`]: the node, attribute
//! and sampling parameters it asks for. Two registrations with equal keys
//! share one monitored item; the most recent registration decides which
//! listener receives the notifications.

mod listeners;

pub use listeners::{ListenerRegistry, Registration, RegistryObserver};

use std::time::Duration;

use crate::transport::types::{
    AttributeId, ClientHandle, MonitoredItemCreateRequest, NodeId, ReadValueId,
};

/// Monitor one attribute of one node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeListenParams {
    pub node_id: NodeId,
    pub attribute: AttributeId,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

/// Monitor events raised anywhere below a root node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeListenParams {
    pub root: NodeId,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

/// The two kinds of listen requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenKind {
    Node,
    Tree,
}

impl std::fmt::Display for ListenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenKind::Node => f.write_str("node"),
            ListenKind::Tree => f.write_str("tree"),
        }
    }
}

/// Identifying parameters of a registration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenKey {
    Node(NodeListenParams),
    Tree(TreeListenParams),
}

impl ListenKey {
    pub fn kind(&self) -> ListenKind {
        match self {
            ListenKey::Node(_) => ListenKind::Node,
            ListenKey::Tree(_) => ListenKind::Tree,
        }
    }

    /// The node the monitored item is created on
    pub fn node_id(&self) -> &NodeId {
        match self {
            ListenKey::Node(p) => &p.node_id,
            ListenKey::Tree(p) => &p.root,
        }
    }

    /// Monitored item request for this key
    ///
    /// Tree keys watch the root's `EventNotifier` attribute.
    pub fn create_request(&self, client_handle: ClientHandle) -> MonitoredItemCreateRequest {
        let (item_to_monitor, sampling_interval, queue_size, discard_oldest) = match self {
            ListenKey::Node(p) => (
                ReadValueId {
                    node_id: p.node_id.clone(),
                    attribute: p.attribute,
                },
                p.sampling_interval,
                p.queue_size,
                p.discard_oldest,
            ),
            ListenKey::Tree(p) => (
                ReadValueId {
                    node_id: p.root.clone(),
                    attribute: AttributeId::EventNotifier,
                },
                p.sampling_interval,
                p.queue_size,
                p.discard_oldest,
            ),
        };
        MonitoredItemCreateRequest {
            item_to_monitor,
            client_handle,
            sampling_interval,
            queue_size,
            discard_oldest,
        }
    }
}

impl std::fmt::Display for ListenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenKey::Node(p) => write!(
                f,
                "{}[{:?}]@{}ms",
                p.node_id,
                p.attribute,
                p.sampling_interval.as_millis()
            ),
            ListenKey::Tree(p) => write!(f, "{}/**@{}ms", p.root, p.sampling_interval.as_millis()),
        }
    }
}
