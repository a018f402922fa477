//! Connection manager
//!
//! Owns one activated session. It validates the server, creates one
//! [`SubscriptionManager`] per listener registry, routes session
//! notifications to them, and offers chunked read/write. The first fatal
//! transport error is reported through the failure callback; after that the
//! manager is dead weight and the driver replaces it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::UaDriverOptions;
use crate::credentials::CredentialProvider;
use crate::error::UaDriverError;
use crate::registry::{ListenKind, ListenerRegistry};
use crate::subscription::{SubscriptionManager, SubscriptionOptions};
use crate::task_queue::FailureHandler;
use crate::transport::types::{DataValue, ReadValueId, SessionEvent, StatusCode, WriteValue};
use crate::transport::{SessionConnector, TransportError, UaSession};

/// Called once with the manager that failed and the cause
pub type FailureCallback = Arc<dyn Fn(&Arc<ConnectionManager>, UaDriverError) + Send + Sync>;

/// Manages one session to the server
pub struct ConnectionManager {
    id: Uuid,
    options: UaDriverOptions,
    session: Arc<dyn UaSession>,
    subscriptions: Vec<Arc<SubscriptionManager>>,
    on_failure: FailureCallback,
    closed: AtomicBool,
    failed: AtomicBool,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Open a session and attach one subscription manager per registry
    ///
    /// The server chain is checked before anything else uses the session;
    /// a rejected chain closes the session and fails the attempt.
    pub async fn connect(
        options: UaDriverOptions,
        connector: Arc<dyn SessionConnector>,
        credentials: Arc<dyn CredentialProvider>,
        on_failure: FailureCallback,
        registries: &[Arc<ListenerRegistry>],
    ) -> Result<Arc<Self>, UaDriverError> {
        let id = Uuid::new_v4();
        let identity = credentials.client_identity(&options)?;

        info!(connection_id = %id, endpoint = %options.endpoint_url, "Connecting");
        let session = match tokio::time::timeout(
            options.request_timeout(),
            connector.connect(&options, identity.as_ref()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(UaDriverError::Timeout(options.request_timeout())),
        };

        // Subscribe before any subscription exists so no notification is missed
        let events = session.subscribe();

        if let Err(e) = credentials.validate_server_chain(&session.server_certificate_chain()) {
            warn!(connection_id = %id, error = %e, "Server certificate rejected");
            session.close().await;
            return Err(e.into());
        }

        let runtime = Handle::current();
        let subscription_options = SubscriptionOptions::from(&options);
        let manager = Arc::new_cyclic(|weak: &Weak<ConnectionManager>| {
            let subscriptions = registries
                .iter()
                .map(|registry| {
                    let weak = weak.clone();
                    let on_fatal: FailureHandler = Arc::new(move |e| {
                        if let Some(manager) = weak.upgrade() {
                            manager.report_failure(e);
                        }
                    });
                    SubscriptionManager::new(
                        registry.clone(),
                        session.clone(),
                        subscription_options.clone(),
                        id,
                        runtime.clone(),
                        on_fatal,
                    )
                })
                .collect();

            Self {
                id,
                options,
                session,
                subscriptions,
                on_failure,
                closed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                listener_handle: Mutex::new(None),
            }
        });
        manager.start_listener(events);

        info!(connection_id = %id, "Connected");
        Ok(manager)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &UaDriverOptions {
        &self.options
    }

    pub fn session(&self) -> &Arc<dyn UaSession> {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a failure has been reported
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> &[Arc<SubscriptionManager>] {
        &self.subscriptions
    }

    /// The subscription manager serving one listen kind
    pub fn subscription(&self, kind: ListenKind) -> Option<&Arc<SubscriptionManager>> {
        self.subscriptions.iter().find(|s| s.kind() == kind)
    }

    /// Read node attributes, chunked by `max_items_per_request`
    ///
    /// Results are in request order. Fatal transport errors are also
    /// reported through the failure callback.
    pub async fn read(
        self: &Arc<Self>,
        nodes: &[ReadValueId],
    ) -> Result<Vec<DataValue>, UaDriverError> {
        let mut values = Vec::with_capacity(nodes.len());
        for chunk in nodes.chunks(self.options.max_items_per_request.max(1)) {
            let mut results = self.call(self.session.read(chunk)).await?;
            results.resize_with(chunk.len(), || DataValue::bad(StatusCode::BAD_UNEXPECTED_ERROR));
            values.extend(results);
        }
        Ok(values)
    }

    /// Write node attributes, chunked by `max_items_per_request`
    pub async fn write(
        self: &Arc<Self>,
        writes: &[WriteValue],
    ) -> Result<Vec<StatusCode>, UaDriverError> {
        let mut statuses = Vec::with_capacity(writes.len());
        for chunk in writes.chunks(self.options.max_items_per_request.max(1)) {
            let mut results = self.call(self.session.write(chunk)).await?;
            results.resize(chunk.len(), StatusCode::BAD_UNEXPECTED_ERROR);
            statuses.extend(results);
        }
        Ok(statuses)
    }

    /// Tear down subscriptions and close the session; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }

        let teardowns: Vec<_> = self.subscriptions.iter().map(|s| s.close()).collect();
        let limit = self.options.request_timeout();
        for teardown in teardowns {
            match tokio::time::timeout(limit, teardown).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => debug!(connection_id = %self.id, error = %e, "Subscription teardown failed"),
                Ok(Err(_)) => debug!(connection_id = %self.id, "Subscription teardown dropped"),
                Err(_) => warn!(connection_id = %self.id, "Subscription teardown timed out"),
            }
        }

        self.session.close().await;
        info!(connection_id = %self.id, "Connection closed");
    }

    /// Report an unrecoverable failure; only the first report is delivered
    pub fn report_failure(self: &Arc<Self>, cause: UaDriverError) {
        if self.is_closed() {
            debug!(connection_id = %self.id, error = %cause, "Failure after close ignored");
            return;
        }
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(connection_id = %self.id, error = %cause, "Connection failed");
        (self.on_failure)(self, cause);
    }

    async fn call<T>(
        self: &Arc<Self>,
        request: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Result<T, UaDriverError> {
        if self.is_closed() {
            return Err(UaDriverError::NotConnected);
        }
        let limit: Duration = self.options.request_timeout();
        let result = match tokio::time::timeout(limit, request).await {
            Ok(result) => result.map_err(UaDriverError::from),
            Err(_) => Err(UaDriverError::Timeout(limit)),
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                self.report_failure(e.clone());
            }
        }
        result
    }

    // =========================================================================
    // Notification routing
    // =========================================================================

    fn start_listener(self: &Arc<Self>, mut events: broadcast::Receiver<SessionEvent>) {
        let weak = Arc::downgrade(self);
        let id = self.id;
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.handle_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(connection_id = %id, skipped = n, "Notification listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if let Some(manager) = weak.upgrade() {
                            manager.report_failure(TransportError::ConnectionClosed.into());
                        }
                        break;
                    }
                }
            }
        });
        *self.listener_handle.lock() = Some(handle);
    }

    fn owner(&self, subscription_id: u32) -> Option<&Arc<SubscriptionManager>> {
        self.subscriptions.iter().find(|s| s.owns(subscription_id))
    }

    fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::DataChange {
                subscription_id,
                client_handle,
                value,
            } => {
                if let Some(manager) = self.owner(subscription_id) {
                    manager.on_data_change(client_handle, &value);
                }
            }
            SessionEvent::Event {
                subscription_id,
                client_handle,
                source_node,
                value,
            } => {
                if let Some(manager) = self.owner(subscription_id) {
                    manager.on_event(client_handle, &source_node, &value);
                }
            }
            SessionEvent::MonitoredItemInvalidated {
                subscription_id,
                client_handle,
                status,
            } => {
                if let Some(manager) = self.owner(subscription_id) {
                    debug!(connection_id = %self.id, subscription_id, client_handle, status = %status, "Item invalidated by server");
                    manager.on_item_invalidated(client_handle);
                }
            }
            SessionEvent::SubscriptionTransferFailed { subscription_id } => {
                if let Some(manager) = self.owner(subscription_id) {
                    manager.on_transfer_failed(subscription_id);
                }
            }
            SessionEvent::ConnectionLost { reason } => {
                self.report_failure(TransportError::ConnectionFailed(reason).into());
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.listener_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::credentials::{AnonymousCredentials, ClientIdentity, StaticCredentials};
    use crate::transport::mock::{MockConnector, RecordedCall};
    use crate::transport::types::{AttributeId, NodeId, Variant};
    use std::sync::atomic::AtomicUsize;

    fn registries() -> Vec<Arc<ListenerRegistry>> {
        vec![
            Arc::new(ListenerRegistry::new(ListenKind::Node)),
            Arc::new(ListenerRegistry::new(ListenKind::Tree)),
        ]
    }

    fn counting_callback() -> (FailureCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let callback: FailureCallback = Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    async fn connect(
        connector: &MockConnector,
        options: UaDriverOptions,
        callback: FailureCallback,
    ) -> Result<Arc<ConnectionManager>, UaDriverError> {
        ConnectionManager::connect(
            options,
            Arc::new(connector.clone()),
            Arc::new(AnonymousCredentials),
            callback,
            &registries(),
        )
        .await
    }

    fn read_id(name: &str) -> ReadValueId {
        ReadValueId {
            node_id: NodeId::string(2, name),
            attribute: AttributeId::Value,
        }
    }

    #[tokio::test]
    async fn test_read_is_chunked() {
        let connector = MockConnector::new(&MockConfig::default());
        let (callback, _) = counting_callback();
        let options = UaDriverOptions {
            max_items_per_request: 2,
            ..Default::default()
        };
        let manager = connect(&connector, options, callback).await.unwrap();

        let nodes: Vec<_> = ["Demo.Temperature", "Demo.Counter", "Demo.Running", "Missing", "Demo.Name"]
            .iter()
            .map(|n| read_id(n))
            .collect();
        let values = manager.read(&nodes).await.unwrap();

        assert_eq!(values.len(), 5);
        assert_eq!(values[0].value, Variant::Double(21.5));
        assert_eq!(values[3].status, StatusCode::BAD_NODE_ID_UNKNOWN);
        assert_eq!(
            connector.count_calls(|c| matches!(c, RecordedCall::Read { .. })),
            3
        );
    }

    #[tokio::test]
    async fn test_untrusted_server_closes_session() {
        let connector = MockConnector::new(&MockConfig::default());
        let (callback, _) = counting_callback();
        let credentials = StaticCredentials::new(
            ClientIdentity {
                certificate: vec![1],
                private_key: vec![2],
            },
            vec![b"some-other-server".to_vec()],
        );

        let result = ConnectionManager::connect(
            UaDriverOptions::default(),
            Arc::new(connector.clone()),
            Arc::new(credentials),
            callback,
            &registries(),
        )
        .await;

        assert!(matches!(result, Err(UaDriverError::Credentials(_))));
        assert!(connector.latest_session().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_connection_lost_reported_once() {
        let connector = MockConnector::new(&MockConfig::default());
        let (callback, count) = counting_callback();
        let manager = connect(&connector, UaDriverOptions::default(), callback)
            .await
            .unwrap();

        let session = connector.latest_session().unwrap();
        session.lose_connection("peer reset");
        let _ = manager.read(&[read_id("Demo.Counter")]).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.has_failed() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silences_failures() {
        let connector = MockConnector::new(&MockConfig::default());
        let (callback, count) = counting_callback();
        let manager = connect(&connector, UaDriverOptions::default(), callback)
            .await
            .unwrap();

        manager.close().await;
        manager.close().await;
        manager.report_failure(UaDriverError::NotConnected);

        assert!(manager.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            connector.count_calls(|c| matches!(c, RecordedCall::CloseSession { .. })),
            1
        );
        assert!(matches!(
            manager.read(&[read_id("Demo.Counter")]).await,
            Err(UaDriverError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_write_reports_per_item_status() {
        let connector = MockConnector::new(&MockConfig::default());
        connector.set_read_only(NodeId::string(2, "Demo.Name"));
        let (callback, _) = counting_callback();
        let manager = connect(&connector, UaDriverOptions::default(), callback)
            .await
            .unwrap();

        let statuses = manager
            .write(&[
                WriteValue {
                    node_id: NodeId::string(2, "Demo.Counter"),
                    attribute: AttributeId::Value,
                    value: Variant::Int32(3),
                },
                WriteValue {
                    node_id: NodeId::string(2, "Demo.Name"),
                    attribute: AttributeId::Value,
                    value: Variant::String("x".into()),
                },
            ])
            .await
            .unwrap();
        assert_eq!(statuses, vec![StatusCode::GOOD, StatusCode::BAD_NOT_WRITABLE]);
    }
}
