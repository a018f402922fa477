//! Mock session connector for testing
//!
//! [`MockConnector`] simulates an OPC UA server in-process. Every service
//! call is recorded, connects can be scripted to fail or stall, nodes can be
//! rejected, and each [`MockSession`] exposes hooks to push notifications,
//! subscription transfer failures, item invalidation and session loss.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::types::{
    AttributeId, ClientHandle, DataValue, Identifier, MonitoredItemCreateRequest,
    MonitoredItemCreateResult, MonitoredItemId, NodeId, ReadValueId, SessionEvent, StatusCode,
    SubscriptionId, SubscriptionParams, Variant, WriteValue,
};
use super::{SessionConnector, TransportError, UaSession};
use crate::config::{MockConfig, UaDriverOptions};
use crate::credentials::ClientIdentity;

/// A service call observed by the mock server
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Connect {
        session: u32,
    },
    Read {
        session: u32,
        nodes: Vec<NodeId>,
    },
    Write {
        session: u32,
        nodes: Vec<NodeId>,
    },
    CreateSubscription {
        session: u32,
        subscription_id: SubscriptionId,
    },
    DeleteSubscription {
        session: u32,
        subscription_id: SubscriptionId,
    },
    CreateMonitoredItems {
        session: u32,
        subscription_id: SubscriptionId,
        nodes: Vec<NodeId>,
    },
    DeleteMonitoredItems {
        session: u32,
        subscription_id: SubscriptionId,
        item_ids: Vec<MonitoredItemId>,
    },
    CloseSession {
        session: u32,
    },
}

/// State shared by the connector and every session it opened
struct MockServer {
    config: MockConfig,
    connect_attempts: AtomicUsize,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    hold: watch::Sender<bool>,
    values: RwLock<HashMap<NodeId, Variant>>,
    rejected: RwLock<HashSet<NodeId>>,
    read_only: RwLock<HashSet<NodeId>>,
    calls: RwLock<Vec<RecordedCall>>,
    sessions: RwLock<Vec<Arc<MockSession>>>,
    certificate_chain: RwLock<Vec<Vec<u8>>>,
    next_session_id: AtomicU32,
    next_subscription_id: AtomicU32,
    next_item_id: AtomicU32,
}

impl MockServer {
    fn record(&self, call: RecordedCall) {
        self.calls.write().push(call);
    }

    async fn delay(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    async fn wait_released(&self) {
        let mut rx = self.hold.subscribe();
        // Err means the sender is gone, which cannot happen while `self` lives
        let _ = rx.wait_for(|held| !*held).await;
    }
}

/// Mock session connector for testing
#[derive(Clone)]
pub struct MockConnector {
    server: Arc<MockServer>,
}

impl MockConnector {
    pub fn new(config: &MockConfig) -> Self {
        let (hold, _) = watch::channel(false);
        let server = MockServer {
            config: config.clone(),
            connect_attempts: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            hold,
            values: RwLock::new(Self::default_address_space()),
            rejected: RwLock::new(HashSet::new()),
            read_only: RwLock::new(HashSet::new()),
            calls: RwLock::new(Vec::new()),
            sessions: RwLock::new(Vec::new()),
            certificate_chain: RwLock::new(vec![b"mock-server-certificate".to_vec()]),
            next_session_id: AtomicU32::new(1),
            next_subscription_id: AtomicU32::new(1),
            next_item_id: AtomicU32::new(1),
        };
        Self {
            server: Arc::new(server),
        }
    }

    fn default_address_space() -> HashMap<NodeId, Variant> {
        HashMap::from([
            (NodeId::string(2, "Demo.Temperature"), Variant::Double(21.5)),
            (NodeId::string(2, "Demo.Pressure"), Variant::Float(1.013)),
            (NodeId::string(2, "Demo.Counter"), Variant::Int32(0)),
            (NodeId::string(2, "Demo.Running"), Variant::Boolean(true)),
            (
                NodeId::string(2, "Demo.Name"),
                Variant::String("Line 1".to_string()),
            ),
            (NodeId::numeric(0, 2258), Variant::DateTime(chrono::Utc::now())),
        ])
    }

    /// Number of `connect` calls seen, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.server.connect_attempts.load(Ordering::SeqCst)
    }

    /// Fail the next `n` connects
    pub fn fail_next_connects(&self, n: usize) {
        self.server.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every connect until switched off
    pub fn fail_all_connects(&self, fail: bool) {
        self.server.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Stall connects until released with `hold_connects(false)`
    pub fn hold_connects(&self, hold: bool) {
        self.server.hold.send_replace(hold);
    }

    pub fn set_value(&self, node: NodeId, value: Variant) {
        self.server.values.write().insert(node, value);
    }

    pub fn value(&self, node: &NodeId) -> Option<Variant> {
        self.server.values.read().get(node).cloned()
    }

    /// Reject monitored items and reads for this node
    pub fn reject_node(&self, node: NodeId) {
        self.server.rejected.write().insert(node);
    }

    pub fn accept_node(&self, node: &NodeId) {
        self.server.rejected.write().remove(node);
    }

    pub fn set_read_only(&self, node: NodeId) {
        self.server.read_only.write().insert(node);
    }

    pub fn set_certificate_chain(&self, chain: Vec<Vec<u8>>) {
        *self.server.certificate_chain.write() = chain;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.server.calls.read().clone()
    }

    pub fn clear_calls(&self) {
        self.server.calls.write().clear();
    }

    /// Count recorded calls matching a predicate
    pub fn count_calls(&self, pred: impl Fn(&RecordedCall) -> bool) -> usize {
        self.server.calls.read().iter().filter(|c| pred(c)).count()
    }

    /// Every session opened so far, oldest first
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.server.sessions.read().clone()
    }

    pub fn latest_session(&self) -> Option<Arc<MockSession>> {
        self.server.sessions.read().last().cloned()
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(
        &self,
        options: &UaDriverOptions,
        identity: Option<&ClientIdentity>,
    ) -> Result<Arc<dyn UaSession>, TransportError> {
        self.server.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.server.wait_released().await;
        self.server.delay().await;

        if self.server.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "{}: connection refused",
                options.endpoint_url
            )));
        }
        let failed_next = self
            .server
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed_next {
            return Err(TransportError::ConnectionFailed(format!(
                "{}: connection refused",
                options.endpoint_url
            )));
        }

        let id = self.server.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(MockSession::new(id, self.server.clone()));
        if self.server.config.simulate_values {
            session.start_simulation(Duration::from_millis(
                self.server.config.simulation_interval_ms.max(1),
            ));
        }
        self.server.sessions.write().push(session.clone());
        self.server.record(RecordedCall::Connect { session: id });

        tracing::debug!(
            session = id,
            endpoint = %options.endpoint_url,
            with_identity = identity.is_some(),
            "Mock connector: session activated"
        );
        Ok(session)
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone)]
struct MockItem {
    client_handle: ClientHandle,
    item: ReadValueId,
}

/// One simulated session
pub struct MockSession {
    id: u32,
    server: Arc<MockServer>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
    subscriptions: RwLock<HashMap<SubscriptionId, HashMap<MonitoredItemId, MockItem>>>,
    simulator: Mutex<Option<JoinHandle<()>>>,
}

impl MockSession {
    fn new(id: u32, server: Arc<MockServer>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            id,
            server,
            events,
            closed: AtomicBool::new(false),
            subscriptions: RwLock::new(HashMap::new()),
            simulator: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscription ids alive on the server for this session
    pub fn active_subscriptions(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.subscriptions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Nodes with a monitored item on any subscription, sorted
    pub fn monitored_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self
            .subscriptions
            .read()
            .values()
            .flat_map(|items| items.values().map(|i| i.item.node_id.clone()))
            .collect();
        nodes.sort();
        nodes
    }

    /// Publish a value change for every item monitoring `node`'s value
    pub fn notify_value(&self, node: &NodeId, value: Variant) {
        self.server.values.write().insert(node.clone(), value.clone());
        for (subscription_id, client_handle) in self.handles_for(node, AttributeId::Value) {
            let _ = self.events.send(SessionEvent::DataChange {
                subscription_id,
                client_handle,
                value: DataValue::good(value.clone()),
            });
        }
    }

    /// Raise an event on `notifier` originating from `source`
    pub fn emit_event(&self, notifier: &NodeId, source: NodeId, value: Variant) {
        for (subscription_id, client_handle) in self.handles_for(notifier, AttributeId::EventNotifier)
        {
            let _ = self.events.send(SessionEvent::Event {
                subscription_id,
                client_handle,
                source_node: source.clone(),
                value: DataValue::good(value.clone()),
            });
        }
    }

    /// Drop a subscription server-side and report the failed transfer
    pub fn fail_transfer(&self, subscription_id: SubscriptionId) {
        self.subscriptions.write().remove(&subscription_id);
        let _ = self
            .events
            .send(SessionEvent::SubscriptionTransferFailed { subscription_id });
    }

    /// Drop every item monitoring `node` and report each as invalidated
    pub fn invalidate_item(&self, node: &NodeId) {
        let mut dropped = Vec::new();
        {
            let mut subscriptions = self.subscriptions.write();
            for (subscription_id, items) in subscriptions.iter_mut() {
                items.retain(|_, item| {
                    if &item.item.node_id == node {
                        dropped.push((*subscription_id, item.client_handle));
                        false
                    } else {
                        true
                    }
                });
            }
        }
        for (subscription_id, client_handle) in dropped {
            let _ = self.events.send(SessionEvent::MonitoredItemInvalidated {
                subscription_id,
                client_handle,
                status: StatusCode::BAD_NODE_ID_UNKNOWN,
            });
        }
    }

    /// Kill the session as if the network went away
    pub fn lose_connection(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::ConnectionLost {
            reason: reason.to_string(),
        });
    }

    fn handles_for(&self, node: &NodeId, attribute: AttributeId) -> Vec<(SubscriptionId, ClientHandle)> {
        self.subscriptions
            .read()
            .iter()
            .flat_map(|(sid, items)| {
                items
                    .values()
                    .filter(|i| &i.item.node_id == node && i.item.attribute == attribute)
                    .map(move |i| (*sid, i.client_handle))
            })
            .collect()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn read_one(&self, node: &ReadValueId) -> DataValue {
        if self.server.rejected.read().contains(&node.node_id) {
            return DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN);
        }
        let values = self.server.values.read();
        let Some(value) = values.get(&node.node_id) else {
            return DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN);
        };
        let name = match &node.node_id.identifier {
            Identifier::String(s) => s.clone(),
            Identifier::Numeric(n) => n.to_string(),
        };
        match node.attribute {
            AttributeId::Value => DataValue::good(value.clone()),
            AttributeId::NodeId => DataValue::good(Variant::NodeId(Box::new(node.node_id.clone()))),
            AttributeId::BrowseName => DataValue::good(Variant::String(name)),
            AttributeId::DisplayName => DataValue::good(Variant::LocalizedText(name)),
            AttributeId::EventNotifier => DataValue::good(Variant::Byte(1)),
            AttributeId::DataType => DataValue::good(Variant::String(value.type_name().to_string())),
        }
    }

    fn write_one(&self, write: &WriteValue) -> StatusCode {
        if write.attribute != AttributeId::Value {
            return StatusCode::BAD_NOT_WRITABLE;
        }
        if self.server.read_only.read().contains(&write.node_id) {
            return StatusCode::BAD_NOT_WRITABLE;
        }
        let mut values = self.server.values.write();
        match values.get(&write.node_id) {
            None => StatusCode::BAD_NODE_ID_UNKNOWN,
            Some(current) if current.type_name() != write.value.type_name() => {
                StatusCode::BAD_TYPE_MISMATCH
            }
            Some(_) => {
                values.insert(write.node_id.clone(), write.value.clone());
                StatusCode::GOOD
            }
        }
    }

    fn start_simulation(self: &Arc<Self>, period: Duration) {
        let weak: Weak<MockSession> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut tick: u64 = 0;
            loop {
                interval.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if session.is_closed() {
                    break;
                }
                tick += 1;
                let nodes: HashSet<NodeId> = session
                    .subscriptions
                    .read()
                    .values()
                    .flat_map(|items| items.values())
                    .filter(|i| i.item.attribute == AttributeId::Value)
                    .map(|i| i.item.node_id.clone())
                    .collect();
                for node in nodes {
                    let current = session.server.values.read().get(&node).cloned();
                    session.notify_value(&node, simulated_value(current.as_ref(), tick));
                }
            }
        });
        *self.simulator.lock() = Some(handle);
    }
}

fn simulated_value(current: Option<&Variant>, tick: u64) -> Variant {
    let wave = (tick as f64 / 10.0).sin();
    match current {
        Some(Variant::Boolean(v)) => Variant::Boolean(!v),
        Some(Variant::Int32(v)) => Variant::Int32(v.wrapping_add(1)),
        Some(Variant::Int64(v)) => Variant::Int64(v.wrapping_add(1)),
        Some(Variant::UInt32(v)) => Variant::UInt32(v.wrapping_add(1)),
        Some(Variant::Float(_)) => Variant::Float(1.0 + wave as f32 * 0.05),
        Some(Variant::String(_)) => Variant::String(format!("tick {}", tick)),
        Some(other @ (Variant::LocalizedText(_) | Variant::ByteString(_))) => other.clone(),
        _ => Variant::Double(20.0 + wave * 2.5),
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if let Some(handle) = self.simulator.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl UaSession for MockSession {
    fn server_certificate_chain(&self) -> Vec<Vec<u8>> {
        self.server.certificate_chain.read().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn read(&self, nodes: &[ReadValueId]) -> Result<Vec<DataValue>, TransportError> {
        self.ensure_open()?;
        self.server.delay().await;
        self.server.record(RecordedCall::Read {
            session: self.id,
            nodes: nodes.iter().map(|n| n.node_id.clone()).collect(),
        });
        Ok(nodes.iter().map(|n| self.read_one(n)).collect())
    }

    async fn write(&self, values: &[WriteValue]) -> Result<Vec<StatusCode>, TransportError> {
        self.ensure_open()?;
        self.server.delay().await;
        self.server.record(RecordedCall::Write {
            session: self.id,
            nodes: values.iter().map(|v| v.node_id.clone()).collect(),
        });
        Ok(values.iter().map(|v| self.write_one(v)).collect())
    }

    async fn create_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> Result<SubscriptionId, TransportError> {
        self.ensure_open()?;
        self.server.delay().await;
        let subscription_id = self.server.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().insert(subscription_id, HashMap::new());
        self.server.record(RecordedCall::CreateSubscription {
            session: self.id,
            subscription_id,
        });
        tracing::debug!(
            session = self.id,
            subscription_id,
            publishing_interval = ?params.publishing_interval,
            "Mock session: subscription created"
        );
        Ok(subscription_id)
    }

    async fn delete_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.server.delay().await;
        self.server.record(RecordedCall::DeleteSubscription {
            session: self.id,
            subscription_id,
        });
        match self.subscriptions.write().remove(&subscription_id) {
            Some(_) => Ok(()),
            None => Err(TransportError::ServiceFault {
                service: "DeleteSubscriptions",
                status: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            }),
        }
    }

    async fn create_monitored_items(
        &self,
        subscription_id: SubscriptionId,
        items: &[MonitoredItemCreateRequest],
    ) -> Result<Vec<MonitoredItemCreateResult>, TransportError> {
        self.ensure_open()?;
        self.server.delay().await;
        self.server.record(RecordedCall::CreateMonitoredItems {
            session: self.id,
            subscription_id,
            nodes: items.iter().map(|i| i.item_to_monitor.node_id.clone()).collect(),
        });

        let rejected = self.server.rejected.read().clone();
        let mut subscriptions = self.subscriptions.write();
        let Some(monitored) = subscriptions.get_mut(&subscription_id) else {
            return Err(TransportError::ServiceFault {
                service: "CreateMonitoredItems",
                status: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            });
        };

        let results = items
            .iter()
            .map(|request| {
                if rejected.contains(&request.item_to_monitor.node_id) {
                    return MonitoredItemCreateResult {
                        status: StatusCode::BAD_NODE_ID_UNKNOWN,
                        monitored_item_id: 0,
                        revised_sampling_interval: Duration::ZERO,
                    };
                }
                let monitored_item_id = self.server.next_item_id.fetch_add(1, Ordering::SeqCst);
                monitored.insert(
                    monitored_item_id,
                    MockItem {
                        client_handle: request.client_handle,
                        item: request.item_to_monitor.clone(),
                    },
                );
                MonitoredItemCreateResult {
                    status: StatusCode::GOOD,
                    monitored_item_id,
                    revised_sampling_interval: request.sampling_interval,
                }
            })
            .collect();
        Ok(results)
    }

    async fn delete_monitored_items(
        &self,
        subscription_id: SubscriptionId,
        item_ids: &[MonitoredItemId],
    ) -> Result<Vec<StatusCode>, TransportError> {
        self.ensure_open()?;
        self.server.delay().await;
        self.server.record(RecordedCall::DeleteMonitoredItems {
            session: self.id,
            subscription_id,
            item_ids: item_ids.to_vec(),
        });

        let mut subscriptions = self.subscriptions.write();
        let Some(monitored) = subscriptions.get_mut(&subscription_id) else {
            return Err(TransportError::ServiceFault {
                service: "DeleteMonitoredItems",
                status: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            });
        };
        Ok(item_ids
            .iter()
            .map(|id| match monitored.remove(id) {
                Some(_) => StatusCode::GOOD,
                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            })
            .collect())
    }

    async fn close(&self) {
        if self.server.config.close_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.server.config.close_latency_ms)).await;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.simulator.lock().take() {
            handle.abort();
        }
        self.subscriptions.write().clear();
        self.server.record(RecordedCall::CloseSession { session: self.id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::string(2, name)
    }

    async fn open(connector: &MockConnector) -> Arc<dyn UaSession> {
        connector
            .connect(&UaDriverOptions::default(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let connector = MockConnector::new(&MockConfig::default());
        connector.fail_next_connects(2);

        let options = UaDriverOptions::default();
        assert!(connector.connect(&options, None).await.is_err());
        assert!(connector.connect(&options, None).await.is_err());
        assert!(connector.connect(&options, None).await.is_ok());
        assert_eq!(connector.connect_attempts(), 3);
        assert_eq!(connector.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_read_known_and_unknown_nodes() {
        let connector = MockConnector::new(&MockConfig::default());
        let session = open(&connector).await;

        let values = session
            .read(&[
                ReadValueId {
                    node_id: node("Demo.Temperature"),
                    attribute: AttributeId::Value,
                },
                ReadValueId {
                    node_id: node("Nope"),
                    attribute: AttributeId::Value,
                },
            ])
            .await
            .unwrap();

        assert_eq!(values[0].value, Variant::Double(21.5));
        assert_eq!(values[1].status, StatusCode::BAD_NODE_ID_UNKNOWN);
    }

    #[tokio::test]
    async fn test_write_checks_type() {
        let connector = MockConnector::new(&MockConfig::default());
        let session = open(&connector).await;

        let statuses = session
            .write(&[
                WriteValue {
                    node_id: node("Demo.Counter"),
                    attribute: AttributeId::Value,
                    value: Variant::Int32(7),
                },
                WriteValue {
                    node_id: node("Demo.Counter"),
                    attribute: AttributeId::Value,
                    value: Variant::String("seven".into()),
                },
            ])
            .await
            .unwrap();

        assert_eq!(statuses, vec![StatusCode::GOOD, StatusCode::BAD_TYPE_MISMATCH]);
        assert_eq!(connector.value(&node("Demo.Counter")), Some(Variant::Int32(7)));
    }

    #[tokio::test]
    async fn test_rejected_node_gets_bad_status() {
        let connector = MockConnector::new(&MockConfig::default());
        connector.reject_node(node("B"));
        let session = open(&connector).await;

        let sid = session
            .create_subscription(&SubscriptionParams::with_publishing_interval(
                Duration::from_secs(1),
            ))
            .await
            .unwrap();
        let request = |name: &str, handle| MonitoredItemCreateRequest {
            item_to_monitor: ReadValueId {
                node_id: node(name),
                attribute: AttributeId::Value,
            },
            client_handle: handle,
            sampling_interval: Duration::from_millis(100),
            queue_size: 1,
            discard_oldest: true,
        };
        let results = session
            .create_monitored_items(sid, &[request("A", 1), request("B", 2)])
            .await
            .unwrap();

        assert!(results[0].status.is_good());
        assert_eq!(results[1].status, StatusCode::BAD_NODE_ID_UNKNOWN);
        let mock = connector.latest_session().unwrap();
        assert_eq!(mock.monitored_nodes(), vec![node("A")]);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_calls() {
        let connector = MockConnector::new(&MockConfig::default());
        let session = open(&connector).await;
        session.close().await;
        session.close().await;

        let result = session.read(&[]).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert_eq!(
            connector.count_calls(|c| matches!(c, RecordedCall::CloseSession { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_notify_value_reaches_subscriber() {
        let connector = MockConnector::new(&MockConfig::default());
        let session = open(&connector).await;
        let mut events = session.subscribe();

        let sid = session
            .create_subscription(&SubscriptionParams::with_publishing_interval(
                Duration::from_secs(1),
            ))
            .await
            .unwrap();
        session
            .create_monitored_items(
                sid,
                &[MonitoredItemCreateRequest {
                    item_to_monitor: ReadValueId {
                        node_id: node("Demo.Counter"),
                        attribute: AttributeId::Value,
                    },
                    client_handle: 42,
                    sampling_interval: Duration::from_millis(100),
                    queue_size: 1,
                    discard_oldest: true,
                }],
            )
            .await
            .unwrap();

        let mock = connector.latest_session().unwrap();
        mock.notify_value(&node("Demo.Counter"), Variant::Int32(5));

        match events.recv().await.unwrap() {
            SessionEvent::DataChange {
                subscription_id,
                client_handle,
                value,
            } => {
                assert_eq!(subscription_id, sid);
                assert_eq!(client_handle, 42);
                assert_eq!(value.value, Variant::Int32(5));
            }
            other => panic!("Expected DataChange, got {:?}", other),
        }
    }
}
