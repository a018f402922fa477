//! Session traits implemented by protocol stacks

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::types::{
    DataValue, MonitoredItemCreateRequest, MonitoredItemCreateResult, MonitoredItemId,
    ReadValueId, SessionEvent, StatusCode, SubscriptionId, SubscriptionParams, WriteValue,
};
use super::TransportError;
use crate::config::UaDriverOptions;
use crate::credentials::ClientIdentity;

/// Opens sessions against an OPC UA endpoint
///
/// The connector performs discovery, secure channel setup and session
/// activation. It owns no per-session state, so one connector serves every
/// connection attempt a driver makes.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        options: &UaDriverOptions,
        identity: Option<&ClientIdentity>,
    ) -> Result<Arc<dyn UaSession>, TransportError>;
}

/// An activated OPC UA session
///
/// All service calls are batched: one request carries many items and the
/// response carries one status or result per item, in request order. A
/// per-item failure is reported through that item's status; an `Err` means
/// the service call as a whole failed.
#[async_trait]
pub trait UaSession: Send + Sync {
    /// DER certificates presented by the server, leaf first
    fn server_certificate_chain(&self) -> Vec<Vec<u8>>;

    /// Subscribe to notifications published on this session
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    async fn read(&self, nodes: &[ReadValueId]) -> Result<Vec<DataValue>, TransportError>;

    async fn write(&self, values: &[WriteValue]) -> Result<Vec<StatusCode>, TransportError>;

    async fn create_subscription(
        &self,
        params: &SubscriptionParams,
    ) -> Result<SubscriptionId, TransportError>;

    async fn delete_subscription(&self, subscription_id: SubscriptionId)
        -> Result<(), TransportError>;

    async fn create_monitored_items(
        &self,
        subscription_id: SubscriptionId,
        items: &[MonitoredItemCreateRequest],
    ) -> Result<Vec<MonitoredItemCreateResult>, TransportError>;

    async fn delete_monitored_items(
        &self,
        subscription_id: SubscriptionId,
        item_ids: &[MonitoredItemId],
    ) -> Result<Vec<StatusCode>, TransportError>;

    /// Close the session; closing twice is harmless
    async fn close(&self);
}
