//! Session connector over the `opcua` client stack
//!
//! Sessions are opened with an [`opcua::client::Client`] and driven by the
//! stack's own event loop. The stack's session retries are switched off:
//! when the event loop ends the session publishes
//! [`SessionEvent::ConnectionLost`] and the driver's reconnect policy takes
//! over. Server trust is left to the driver's credential provider, which
//! sees the certificate from the matching endpoint description.
//!
//! The rest of the driver only deals in [`super::types`]; the conversions
//! to and from `opcua::types` live at the bottom of this module.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opcua::client::{Client, ClientBuilder, IdentityToken, MonitoredItem, Session, SubscriptionCallbacks};
use opcua::types as ua;
use opcua::types::enums::MonitoringMode;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{
    AttributeId, DataValue, Identifier, MonitoredItemCreateRequest, MonitoredItemCreateResult,
    MonitoredItemId, NodeId, ReadValueId, SessionEvent, StatusCode, SubscriptionId,
    SubscriptionParams, Variant, WriteValue,
};
use super::{SessionConnector, TransportError, UaSession};
use crate::config::{OpcuaConfig, SecurityMode, UaDriverOptions};
use crate::credentials::ClientIdentity;

/// Event fields selected for tree listens, in notification order
const EVENT_FIELDS: [&str; 2] = ["SourceNode", "Message"];

/// Opens sessions with the `opcua` client stack
pub struct OpcuaConnector {
    config: OpcuaConfig,
}

impl OpcuaConnector {
    pub fn new(config: &OpcuaConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn client(&self, options: &UaDriverOptions) -> Result<Client, TransportError> {
        ClientBuilder::new()
            .application_name(options.application_name.as_str())
            .application_uri(options.application_uri.as_str())
            .product_uri(options.application_uri.as_str())
            .pki_dir(self.config.pki_dir.clone())
            .create_sample_keypair(self.config.create_sample_keypair)
            .trust_server_certs(true)
            .session_retry_limit(0)
            .session_timeout(options.session_timeout_ms.min(u32::MAX as u64) as u32)
            .client()
            .map_err(|errors| TransportError::InvalidConfig(errors.join("; ")))
    }
}

#[async_trait]
impl SessionConnector for OpcuaConnector {
    async fn connect(
        &self,
        options: &UaDriverOptions,
        identity: Option<&ClientIdentity>,
    ) -> Result<Arc<dyn UaSession>, TransportError> {
        let endpoint_url = options.endpoint_url.as_str();
        let policy_uri = options.security_policy.uri();
        let mode = security_mode(options.security_mode);
        let mut client = self.client(options)?;

        let endpoints = client
            .get_server_endpoints_from_url(endpoint_url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", endpoint_url, e)))?;
        let endpoint = endpoints
            .iter()
            .find(|e| e.security_mode == mode && e.security_policy_uri.as_ref() == policy_uri)
            .ok_or_else(|| {
                TransportError::Security(format!(
                    "{} offers no endpoint for {} with {:?}",
                    endpoint_url, policy_uri, options.security_mode
                ))
            })?;
        let server_chain: Vec<Vec<u8>> = endpoint.server_certificate.value.clone().into_iter().collect();

        debug!(
            endpoint = endpoint_url,
            policy = policy_uri,
            with_identity = identity.is_some(),
            "Opening OPC UA session"
        );
        let (session, event_loop) = client
            .connect_to_matching_endpoint(
                (endpoint_url, policy_uri, mode, ua::UserTokenPolicy::anonymous()),
                identity_token(options),
            )
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", endpoint_url, e)))?;

        let event_loop = event_loop.spawn();
        if !session.wait_for_connection().await {
            let outcome = match event_loop.await {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            return Err(TransportError::ConnectionFailed(format!(
                "{}: {}",
                endpoint_url, outcome
            )));
        }

        info!(endpoint = endpoint_url, "OPC UA session activated");
        Ok(Arc::new(OpcuaSession::new(session, server_chain, event_loop)))
    }
}

fn identity_token(options: &UaDriverOptions) -> IdentityToken {
    match (&options.username, &options.password) {
        (Some(user), Some(password)) => IdentityToken::UserName(user.clone(), password.clone().into()),
        _ => IdentityToken::Anonymous,
    }
}

fn security_mode(mode: SecurityMode) -> ua::MessageSecurityMode {
    match mode {
        SecurityMode::None => ua::MessageSecurityMode::None,
        SecurityMode::Sign => ua::MessageSecurityMode::Sign,
        SecurityMode::SignAndEncrypt => ua::MessageSecurityMode::SignAndEncrypt,
    }
}

// =============================================================================
// Session
// =============================================================================

/// One activated session on the `opcua` client stack
pub struct OpcuaSession {
    session: Arc<Session>,
    events: broadcast::Sender<SessionEvent>,
    server_chain: Vec<Vec<u8>>,
    closed: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl OpcuaSession {
    fn new(
        session: Arc<Session>,
        server_chain: Vec<Vec<u8>>,
        event_loop: JoinHandle<ua::StatusCode>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let closed = Arc::new(AtomicBool::new(false));

        let watcher = {
            let events = events.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let outcome = match event_loop.await {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                if !closed.load(Ordering::SeqCst) {
                    warn!(outcome = %outcome, "OPC UA session event loop ended");
                    let _ = events.send(SessionEvent::ConnectionLost {
                        reason: format!("session event loop ended: {}", outcome),
                    });
                }
            })
        };

        Self {
            session,
            events,
            server_chain,
            closed,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Callbacks forwarding one subscription's notifications as session events
    ///
    /// The subscription id is only known once the server answers, so the
    /// callbacks read it from `subscription_id` when they fire.
    fn callbacks(&self, subscription_id: Arc<AtomicU32>) -> SubscriptionCallbacks {
        let status_events = self.events.clone();
        let status_id = subscription_id.clone();
        let data_events = self.events.clone();
        let data_id = subscription_id.clone();
        let event_events = self.events.clone();
        let event_id = subscription_id;

        SubscriptionCallbacks::new(
            move |notification: ua::StatusChangeNotification| {
                if notification.status.is_bad() {
                    let _ = status_events.send(SessionEvent::SubscriptionTransferFailed {
                        subscription_id: status_id.load(Ordering::SeqCst),
                    });
                }
            },
            move |value: ua::DataValue, item: &MonitoredItem| {
                let _ = data_events.send(data_event(
                    data_id.load(Ordering::SeqCst),
                    item.client_handle(),
                    from_data_value(value),
                ));
            },
            move |fields: Option<Vec<ua::Variant>>, item: &MonitoredItem| {
                let Some((source_node, message)) = event_fields(fields) else {
                    debug!(client_handle = item.client_handle(), "Event without a source node dropped");
                    return;
                };
                let _ = event_events.send(SessionEvent::Event {
                    subscription_id: event_id.load(Ordering::SeqCst),
                    client_handle: item.client_handle(),
                    source_node,
                    value: DataValue::good(message),
                });
            },
        )
    }
}

impl Drop for OpcuaSession {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl UaSession for OpcuaSession {
    fn server_certificate_chain(&self) -> Vec<Vec<u8>> {
        self.server_chain.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn read(&self, nodes: &[ReadValueId]) -> Result<Vec<DataValue>, TransportError> {
        self.ensure_open()?;
        let targets: Vec<ua::ReadValueId> = nodes.iter().map(to_read_value_id).collect();
        let values = self
            .session
            .read(&targets, ua::TimestampsToReturn::Both, 0.0)
            .await
            .map_err(|status| fault("Read", status))?;
        Ok(values.into_iter().map(from_data_value).collect())
    }

    async fn write(&self, values: &[WriteValue]) -> Result<Vec<StatusCode>, TransportError> {
        self.ensure_open()?;
        let targets: Vec<ua::WriteValue> = values.iter().map(to_write_value).collect();
        let statuses = self
            .session
            .write(&targets)
            .await
            .map_err(|status| fault("Write", status))?;
        Ok(statuses.into_iter().map(from_status).collect())
    }

    async fn create_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> Result<SubscriptionId, TransportError> {
        self.ensure_open()?;
        let slot = Arc::new(AtomicU32::new(0));
        let subscription_id = self
            .session
            .create_subscription(
                params.publishing_interval,
                params.lifetime_count,
                params.max_keep_alive_count,
                0,
                params.priority,
                true,
                self.callbacks(slot.clone()),
            )
            .await
            .map_err(|status| fault("CreateSubscription", status))?;
        slot.store(subscription_id, Ordering::SeqCst);
        Ok(subscription_id)
    }

    async fn delete_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.session
            .delete_subscription(subscription_id)
            .await
            .map(|_| ())
            .map_err(|status| fault("DeleteSubscriptions", status))
    }

    async fn create_monitored_items(
        &self,
        subscription_id: SubscriptionId,
        items: &[MonitoredItemCreateRequest],
    ) -> Result<Vec<MonitoredItemCreateResult>, TransportError> {
        self.ensure_open()?;
        let requests: Vec<ua::MonitoredItemCreateRequest> =
            items.iter().map(to_create_request).collect();
        let created = self
            .session
            .create_monitored_items(subscription_id, ua::TimestampsToReturn::Both, requests)
            .await
            .map_err(|status| fault("CreateMonitoredItems", status))?;
        Ok(created
            .into_iter()
            .map(|item| MonitoredItemCreateResult {
                status: from_status(item.result.status_code),
                monitored_item_id: item.result.monitored_item_id,
                revised_sampling_interval: millis(item.result.revised_sampling_interval),
            })
            .collect())
    }

    async fn delete_monitored_items(
        &self,
        subscription_id: SubscriptionId,
        item_ids: &[MonitoredItemId],
    ) -> Result<Vec<StatusCode>, TransportError> {
        self.ensure_open()?;
        let statuses = self
            .session
            .delete_monitored_items(subscription_id, item_ids)
            .await
            .map_err(|status| fault("DeleteMonitoredItems", status))?;
        Ok(statuses.into_iter().map(from_status).collect())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(status) = self.session.disconnect().await {
            debug!(status = %status, "OPC UA disconnect reported an error");
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn fault(service: &'static str, status: ua::StatusCode) -> TransportError {
    let status = from_status(status);
    if status.is_connection_loss() {
        TransportError::ConnectionClosed
    } else {
        TransportError::ServiceFault { service, status }
    }
}

fn from_status(status: ua::StatusCode) -> StatusCode {
    StatusCode(status.bits())
}

fn millis(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0) / 1_000.0)
}

fn ua_string(value: &ua::UAString) -> String {
    value.value().clone().unwrap_or_default()
}

fn to_node_id(node: &NodeId) -> ua::NodeId {
    match &node.identifier {
        Identifier::Numeric(v) => ua::NodeId::new(node.namespace, *v),
        Identifier::String(v) => ua::NodeId::new(node.namespace, v.clone()),
    }
}

/// Guid and opaque identifiers have no counterpart in the driver's node ids
fn from_node_id(node: &ua::NodeId) -> Option<NodeId> {
    match &node.identifier {
        ua::Identifier::Numeric(v) => Some(NodeId::numeric(node.namespace, *v)),
        ua::Identifier::String(v) => Some(NodeId::string(node.namespace, ua_string(v))),
        _ => None,
    }
}

fn to_read_value_id(target: &ReadValueId) -> ua::ReadValueId {
    let mut read = ua::ReadValueId::new_value(to_node_id(&target.node_id));
    read.attribute_id = target.attribute as u32;
    read
}

fn to_write_value(write: &WriteValue) -> ua::WriteValue {
    ua::WriteValue {
        node_id: to_node_id(&write.node_id),
        attribute_id: write.attribute as u32,
        index_range: Default::default(),
        value: ua::DataValue::value_only(to_variant(&write.value)),
    }
}

fn event_filter() -> ua::EventFilter {
    let field = |name: &str| ua::SimpleAttributeOperand {
        type_definition_id: ua::ObjectTypeId::BaseEventType.into(),
        browse_path: Some(vec![ua::QualifiedName::from(name)]),
        attribute_id: ua::AttributeId::Value as u32,
        index_range: Default::default(),
    };
    ua::EventFilter {
        select_clauses: Some(EVENT_FIELDS.iter().map(|name| field(name)).collect()),
        where_clause: ua::ContentFilter { elements: None },
    }
}

fn to_create_request(request: &MonitoredItemCreateRequest) -> ua::MonitoredItemCreateRequest {
    let filter = match request.item_to_monitor.attribute {
        AttributeId::EventNotifier => ua::ExtensionObject::from_message(event_filter()),
        _ => Default::default(),
    };
    ua::MonitoredItemCreateRequest {
        item_to_monitor: to_read_value_id(&request.item_to_monitor),
        monitoring_mode: MonitoringMode::Reporting,
        requested_parameters: ua::MonitoringParameters {
            client_handle: request.client_handle,
            sampling_interval: request.sampling_interval.as_secs_f64() * 1_000.0,
            filter,
            queue_size: request.queue_size,
            discard_oldest: request.discard_oldest,
        },
    }
}

/// A bad status on a sampled value means the server stopped serving the item
fn data_event(subscription_id: SubscriptionId, client_handle: u32, value: DataValue) -> SessionEvent {
    if value.status.is_bad() {
        SessionEvent::MonitoredItemInvalidated {
            subscription_id,
            client_handle,
            status: value.status,
        }
    } else {
        SessionEvent::DataChange {
            subscription_id,
            client_handle,
            value,
        }
    }
}

/// Source node and message of an event selected with [`EVENT_FIELDS`]
fn event_fields(fields: Option<Vec<ua::Variant>>) -> Option<(NodeId, Variant)> {
    let mut fields = fields?.into_iter();
    let source_node = match fields.next()? {
        ua::Variant::NodeId(node) => from_node_id(&node)?,
        _ => return None,
    };
    let message = fields.next().map(from_variant).unwrap_or(Variant::Empty);
    Some((source_node, message))
}

fn from_data_value(value: ua::DataValue) -> DataValue {
    DataValue {
        value: value.value.map(from_variant).unwrap_or(Variant::Empty),
        status: value.status.map(from_status).unwrap_or(StatusCode::GOOD),
        source_timestamp: value.source_timestamp.map(|t| t.as_chrono()),
        server_timestamp: value.server_timestamp.map(|t| t.as_chrono()),
    }
}

fn from_variant(value: ua::Variant) -> Variant {
    match value {
        ua::Variant::Empty => Variant::Empty,
        ua::Variant::Boolean(v) => Variant::Boolean(v),
        ua::Variant::SByte(v) => Variant::SByte(v),
        ua::Variant::Byte(v) => Variant::Byte(v),
        ua::Variant::Int16(v) => Variant::Int16(v),
        ua::Variant::UInt16(v) => Variant::UInt16(v),
        ua::Variant::Int32(v) => Variant::Int32(v),
        ua::Variant::UInt32(v) => Variant::UInt32(v),
        ua::Variant::Int64(v) => Variant::Int64(v),
        ua::Variant::UInt64(v) => Variant::UInt64(v),
        ua::Variant::Float(v) => Variant::Float(v),
        ua::Variant::Double(v) => Variant::Double(v),
        ua::Variant::String(v) => Variant::String(ua_string(&v)),
        ua::Variant::ByteString(v) => Variant::ByteString(v.value.unwrap_or_default()),
        ua::Variant::LocalizedText(v) => Variant::LocalizedText(ua_string(&v.text)),
        ua::Variant::QualifiedName(v) => Variant::String(ua_string(&v.name)),
        ua::Variant::DateTime(v) => Variant::DateTime(v.as_chrono()),
        ua::Variant::NodeId(v) => match from_node_id(&v) {
            Some(node) => Variant::NodeId(Box::new(node)),
            None => Variant::String(format!("{:?}", v)),
        },
        other => Variant::String(format!("{:?}", other)),
    }
}

fn to_variant(value: &Variant) -> ua::Variant {
    match value {
        Variant::Empty => ua::Variant::Empty,
        Variant::Boolean(v) => ua::Variant::Boolean(*v),
        Variant::SByte(v) => ua::Variant::SByte(*v),
        Variant::Byte(v) => ua::Variant::Byte(*v),
        Variant::Int16(v) => ua::Variant::Int16(*v),
        Variant::UInt16(v) => ua::Variant::UInt16(*v),
        Variant::Int32(v) => ua::Variant::Int32(*v),
        Variant::UInt32(v) => ua::Variant::UInt32(*v),
        Variant::Int64(v) => ua::Variant::Int64(*v),
        Variant::UInt64(v) => ua::Variant::UInt64(*v),
        Variant::Float(v) => ua::Variant::Float(*v),
        Variant::Double(v) => ua::Variant::Double(*v),
        Variant::String(v) => ua::Variant::String(ua::UAString::from(v.as_str())),
        Variant::ByteString(v) => ua::Variant::ByteString(ua::ByteString::from(v.clone())),
        Variant::LocalizedText(v) => {
            ua::Variant::LocalizedText(Box::new(ua::LocalizedText::new("", v.as_str())))
        }
        Variant::DateTime(v) => ua::Variant::DateTime(Box::new(ua::DateTime::from(*v))),
        Variant::NodeId(v) => ua::Variant::NodeId(Box::new(to_node_id(v))),
    }
}
