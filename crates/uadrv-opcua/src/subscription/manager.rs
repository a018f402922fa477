//! Subscription state machine and reconciliation
//!
//! ```text
//!                  registry non-empty
//!   Unsubscribed ─────────────────────▶ Subscribed(id, items)
//!        ▲                                   │  │
//!        │  last item removed / close        │  │ reconcile: create added,
//!        └───────────────────────────────────┘  │ delete removed
//!        ▲                                      │
//!        │  transfer failed (then reconcile)    │
//!        └──────────────────────────────────────┘
//! ```
//!
//! Reconciliation is driven by two counters. Every registry mutation bumps
//! the target counter and queues a pass; a pass that finds the target
//! already reconciled does nothing, so bursts of changes collapse into one
//! round of service calls.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::UaDriverOptions;
use crate::error::UaDriverError;
use crate::registry::{ListenKey, ListenKind, ListenerRegistry, RegistryObserver};
use crate::task_queue::{FailureHandler, SerialTaskQueue};
use crate::transport::types::{
    ClientHandle, DataValue, MonitoredItemCreateRequest, MonitoredItemId, NodeId,
    SubscriptionId, SubscriptionParams,
};
use crate::transport::{TransportError, UaSession};

/// Settings a subscription manager takes from the driver options
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    pub publish_interval: Duration,
    pub request_timeout: Duration,
    pub max_items_per_request: usize,
}

impl From<&UaDriverOptions> for SubscriptionOptions {
    fn from(options: &UaDriverOptions) -> Self {
        Self {
            publish_interval: options.publish_interval(),
            request_timeout: options.request_timeout(),
            max_items_per_request: options.max_items_per_request.max(1),
        }
    }
}

/// Coarse view of the subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStateKind {
    Unsubscribed,
    Subscribed,
}

#[derive(Debug)]
struct MonitoredItemHandle {
    monitored_item_id: MonitoredItemId,
    client_handle: ClientHandle,
    valid: Arc<AtomicBool>,
}

enum SubscriptionState {
    Unsubscribed,
    Subscribed {
        subscription_id: SubscriptionId,
        items: HashMap<ListenKey, MonitoredItemHandle>,
    },
}

/// Lookup from a notification's client handle to its key
#[derive(Clone)]
struct ItemRoute {
    key: ListenKey,
    valid: Arc<AtomicBool>,
}

struct ManagerObserver(Weak<SubscriptionManager>);

impl RegistryObserver for ManagerObserver {
    fn registry_changed(&self, _kind: ListenKind) {
        if let Some(manager) = self.0.upgrade() {
            manager.request_reconciliation();
        }
    }
}

/// Keeps one subscription's monitored items equal to a registry's keys
pub struct SubscriptionManager {
    kind: ListenKind,
    connection_id: Uuid,
    session: Arc<dyn UaSession>,
    registry: Arc<ListenerRegistry>,
    options: SubscriptionOptions,
    queue: SerialTaskQueue,

    /// Only touched from queued tasks
    state: tokio::sync::Mutex<SubscriptionState>,

    /// Read concurrently by the notification listener
    routes: RwLock<HashMap<ClientHandle, ItemRoute>>,
    active_subscription: RwLock<Option<SubscriptionId>>,

    target_state: AtomicU64,
    reconciled_state: AtomicU64,
    next_client_handle: AtomicU32,
    observer: Mutex<Option<Arc<dyn RegistryObserver>>>,
}

impl SubscriptionManager {
    /// Create a manager and attach it to `registry`
    ///
    /// If the registry already holds keys a first reconciliation is queued
    /// right away. Task failures are logged; fatal ones are also passed to
    /// `on_fatal`.
    pub fn new(
        registry: Arc<ListenerRegistry>,
        session: Arc<dyn UaSession>,
        options: SubscriptionOptions,
        connection_id: Uuid,
        runtime: Handle,
        on_fatal: FailureHandler,
    ) -> Arc<Self> {
        let kind = registry.kind();
        let queue = SerialTaskQueue::new(format!("{}-{}", kind, connection_id), runtime);
        queue.on_failure(move |e| {
            error!(connection_id = %connection_id, kind = %kind, error = %e, "Subscription task failed");
            if e.is_fatal() {
                on_fatal(e);
            }
        });

        let manager = Arc::new(Self {
            kind,
            connection_id,
            session,
            registry,
            options,
            queue,
            state: tokio::sync::Mutex::new(SubscriptionState::Unsubscribed),
            routes: RwLock::new(HashMap::new()),
            active_subscription: RwLock::new(None),
            target_state: AtomicU64::new(0),
            reconciled_state: AtomicU64::new(0),
            next_client_handle: AtomicU32::new(1),
            observer: Mutex::new(None),
        });

        let observer: Arc<dyn RegistryObserver> =
            Arc::new(ManagerObserver(Arc::downgrade(&manager)));
        manager.registry.add_observer(observer.clone());
        *manager.observer.lock() = Some(observer);

        if !manager.registry.is_empty() {
            manager.request_reconciliation();
        }
        manager
    }

    pub fn kind(&self) -> ListenKind {
        self.kind
    }

    pub fn state_kind(&self) -> SubscriptionStateKind {
        match *self.active_subscription.read() {
            Some(_) => SubscriptionStateKind::Subscribed,
            None => SubscriptionStateKind::Unsubscribed,
        }
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        *self.active_subscription.read()
    }

    /// Whether notifications for `subscription_id` belong to this manager
    pub fn owns(&self, subscription_id: SubscriptionId) -> bool {
        *self.active_subscription.read() == Some(subscription_id)
    }

    /// Keys that currently have a monitored item
    ///
    /// Waits for any reconciliation pass in flight.
    pub async fn monitored_keys(&self) -> HashSet<ListenKey> {
        match &*self.state.lock().await {
            SubscriptionState::Unsubscribed => HashSet::new(),
            SubscriptionState::Subscribed { items, .. } => items.keys().cloned().collect(),
        }
    }

    /// True once the latest requested pass has run and nothing is queued
    pub fn is_reconciled(&self) -> bool {
        self.target_state.load(Ordering::SeqCst) == self.reconciled_state.load(Ordering::SeqCst)
            && !self.queue.is_busy()
    }

    /// Queue a reconciliation pass against the registry
    pub fn request_reconciliation(self: &Arc<Self>) {
        let target = self.target_state.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(connection_id = %self.connection_id, kind = %self.kind, target, "Reconciliation requested");
        let this = self.clone();
        self.queue.push(move || async move { this.reconcile().await }.boxed());
    }

    /// The server could not carry the subscription over to a new session
    ///
    /// Forces the state back to unsubscribed and reconciles again, which
    /// recreates the subscription while registrations remain.
    pub fn on_transfer_failed(self: &Arc<Self>, subscription_id: SubscriptionId) {
        warn!(
            connection_id = %self.connection_id,
            kind = %self.kind,
            subscription_id,
            "Subscription transfer failed"
        );
        let this = self.clone();
        self.queue.push(move || {
            async move {
                this.reset(subscription_id).await;
                Ok(())
            }
            .boxed()
        });
        self.request_reconciliation();
    }

    /// The server stopped servicing one monitored item
    pub fn on_item_invalidated(self: &Arc<Self>, client_handle: ClientHandle) {
        let key = {
            let routes = self.routes.read();
            let Some(route) = routes.get(&client_handle) else {
                return;
            };
            route.valid.store(false, Ordering::SeqCst);
            route.key.clone()
        };
        debug!(connection_id = %self.connection_id, key = %key, "Monitored item invalidated");
        self.request_reconciliation();
    }

    /// Deliver a sampled value to the listener registered for the item
    pub fn on_data_change(&self, client_handle: ClientHandle, value: &DataValue) {
        if let Some(key) = self.route(client_handle) {
            self.registry.dispatch(&key, value, None);
        }
    }

    /// Deliver an event raised by `source` below a monitored root
    pub fn on_event(&self, client_handle: ClientHandle, source: &NodeId, value: &DataValue) {
        if let Some(key) = self.route(client_handle) {
            self.registry.dispatch(&key, value, Some(source));
        }
    }

    /// Detach from the registry and tear the subscription down
    ///
    /// Pending passes are dropped; the teardown runs after the pass in
    /// flight. The receiver resolves once the teardown has finished.
    pub fn close(self: &Arc<Self>) -> oneshot::Receiver<Result<(), UaDriverError>> {
        if let Some(observer) = self.observer.lock().take() {
            self.registry.remove_observer(&observer);
        }
        let this = self.clone();
        self.queue
            .close(move || async move { this.teardown().await }.boxed())
    }

    fn route(&self, client_handle: ClientHandle) -> Option<ListenKey> {
        let routes = self.routes.read();
        let route = routes.get(&client_handle)?;
        if route.valid.load(Ordering::SeqCst) {
            Some(route.key.clone())
        } else {
            None
        }
    }

    // =========================================================================
    // Queued tasks
    // =========================================================================

    async fn reconcile(&self) -> Result<(), UaDriverError> {
        let target = self.target_state.load(Ordering::SeqCst);
        if target == self.reconciled_state.load(Ordering::SeqCst) {
            trace!(kind = %self.kind, target, "Already reconciled");
            return Ok(());
        }

        let mut state = self.state.lock().await;

        if let SubscriptionState::Subscribed { items, .. } = &mut *state {
            let mut routes = self.routes.write();
            items.retain(|key, handle| {
                let valid = handle.valid.load(Ordering::SeqCst);
                if !valid {
                    debug!(kind = %self.kind, key = %key, "Purging invalid monitored item");
                    routes.remove(&handle.client_handle);
                }
                valid
            });
        }

        let previous: HashSet<ListenKey> = match &*state {
            SubscriptionState::Unsubscribed => HashSet::new(),
            SubscriptionState::Subscribed { items, .. } => items.keys().cloned().collect(),
        };
        let mut added = Vec::new();
        let mut removed = Vec::new();
        self.registry.compute_differences(
            &previous,
            |key| added.push(key.clone()),
            |key| removed.push(key.clone()),
        );

        let empty_subscription = matches!(
            &*state,
            SubscriptionState::Subscribed { items, .. } if items.is_empty()
        );
        if added.is_empty() && removed.is_empty() && !empty_subscription {
            self.reconciled_state.store(target, Ordering::SeqCst);
            return Ok(());
        }

        if added.is_empty() && previous.len() == removed.len() {
            self.unsubscribe(&mut state).await?;
            self.reconciled_state.store(target, Ordering::SeqCst);
            return Ok(());
        }

        let subscription_id = match &*state {
            SubscriptionState::Subscribed {
                subscription_id, ..
            } => *subscription_id,
            SubscriptionState::Unsubscribed => {
                let subscription_id = self.subscribe().await?;
                *state = SubscriptionState::Subscribed {
                    subscription_id,
                    items: HashMap::new(),
                };
                subscription_id
            }
        };

        let SubscriptionState::Subscribed { items, .. } = &mut *state else {
            return Ok(());
        };

        // Removed keys leave the local map whether or not the server agrees
        let doomed: Vec<MonitoredItemHandle> = removed
            .iter()
            .filter_map(|key| items.remove(key))
            .collect();
        {
            let mut routes = self.routes.write();
            for handle in &doomed {
                routes.remove(&handle.client_handle);
            }
        }
        let doomed_ids: Vec<MonitoredItemId> =
            doomed.iter().map(|h| h.monitored_item_id).collect();

        let (created, deleted) = futures::join!(
            self.create_items(subscription_id, &added),
            self.delete_items(subscription_id, &doomed_ids),
        );
        let (created, create_error) = created;
        let created_count = created.len();
        items.extend(created);

        info!(
            connection_id = %self.connection_id,
            kind = %self.kind,
            subscription_id,
            added = created_count,
            failed = added.len() - created_count,
            removed = doomed_ids.len(),
            items = items.len(),
            "Reconciled monitored items"
        );

        let now_empty = items.is_empty();
        if now_empty {
            self.unsubscribe(&mut state).await?;
        }

        if let Some(e) = create_error.or(deleted.err()) {
            return Err(e);
        }
        self.reconciled_state.store(target, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self, subscription_id: SubscriptionId) {
        let mut state = self.state.lock().await;
        let matches = matches!(
            &*state,
            SubscriptionState::Subscribed { subscription_id: id, .. } if *id == subscription_id
        );
        if !matches {
            debug!(kind = %self.kind, subscription_id, "Transfer failure for unknown subscription");
            return;
        }
        *state = SubscriptionState::Unsubscribed;
        self.routes.write().clear();
        *self.active_subscription.write() = None;
    }

    async fn teardown(&self) -> Result<(), UaDriverError> {
        let mut state = self.state.lock().await;
        let SubscriptionState::Subscribed {
            subscription_id,
            items,
        } = std::mem::replace(&mut *state, SubscriptionState::Unsubscribed)
        else {
            return Ok(());
        };
        self.routes.write().clear();
        *self.active_subscription.write() = None;

        let ids: Vec<MonitoredItemId> = items.values().map(|h| h.monitored_item_id).collect();
        if let Err(e) = self.delete_items(subscription_id, &ids).await {
            debug!(kind = %self.kind, subscription_id, error = %e, "Item deletion failed during teardown");
        }
        match self
            .call(self.session.delete_subscription(subscription_id))
            .await
        {
            Ok(()) => {
                info!(connection_id = %self.connection_id, kind = %self.kind, subscription_id, "Subscription closed");
            }
            Err(e) => {
                debug!(kind = %self.kind, subscription_id, error = %e, "Subscription deletion failed during teardown");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Service calls
    // =========================================================================

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, UaDriverError> {
        match tokio::time::timeout(self.options.request_timeout, request).await {
            Ok(result) => result.map_err(UaDriverError::from),
            Err(_) => Err(UaDriverError::Timeout(self.options.request_timeout)),
        }
    }

    async fn subscribe(&self) -> Result<SubscriptionId, UaDriverError> {
        let params = SubscriptionParams::with_publishing_interval(self.options.publish_interval);
        let subscription_id = self.call(self.session.create_subscription(&params)).await?;
        *self.active_subscription.write() = Some(subscription_id);
        info!(
            connection_id = %self.connection_id,
            kind = %self.kind,
            subscription_id,
            "Subscription created"
        );
        Ok(subscription_id)
    }

    async fn unsubscribe(&self, state: &mut SubscriptionState) -> Result<(), UaDriverError> {
        let SubscriptionState::Subscribed {
            subscription_id,
            items,
        } = std::mem::replace(state, SubscriptionState::Unsubscribed)
        else {
            return Ok(());
        };
        {
            let mut routes = self.routes.write();
            for handle in items.values() {
                routes.remove(&handle.client_handle);
            }
        }
        *self.active_subscription.write() = None;

        match self
            .call(self.session.delete_subscription(subscription_id))
            .await
        {
            Ok(()) => {
                info!(connection_id = %self.connection_id, kind = %self.kind, subscription_id, "Subscription deleted");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(kind = %self.kind, subscription_id, error = %e, "Failed to delete subscription");
                Ok(())
            }
        }
    }

    /// Create items for `keys`, one request per chunk, chunks in parallel
    ///
    /// Returns the items the server accepted and the first fatal error seen.
    async fn create_items(
        &self,
        subscription_id: SubscriptionId,
        keys: &[ListenKey],
    ) -> (Vec<(ListenKey, MonitoredItemHandle)>, Option<UaDriverError>) {
        if keys.is_empty() {
            return (Vec::new(), None);
        }

        // Routes exist before the call so early notifications find their key
        let prepared: Vec<(ListenKey, MonitoredItemCreateRequest, Arc<AtomicBool>)> = {
            let mut routes = self.routes.write();
            keys.iter()
                .map(|key| {
                    let client_handle = self.next_client_handle.fetch_add(1, Ordering::SeqCst);
                    let valid = Arc::new(AtomicBool::new(true));
                    routes.insert(
                        client_handle,
                        ItemRoute {
                            key: key.clone(),
                            valid: valid.clone(),
                        },
                    );
                    (key.clone(), key.create_request(client_handle), valid)
                })
                .collect()
        };

        let calls = prepared
            .chunks(self.options.max_items_per_request)
            .map(|chunk| async move {
                let requests: Vec<MonitoredItemCreateRequest> =
                    chunk.iter().map(|(_, request, _)| request.clone()).collect();
                let result = self
                    .call(self.session.create_monitored_items(subscription_id, &requests))
                    .await;
                (chunk, result)
            });
        let responses = join_all(calls).await;

        let mut created = Vec::new();
        let mut fatal = None;
        let mut routes = self.routes.write();
        for (chunk, response) in responses {
            match response {
                Ok(results) => {
                    for (i, (key, request, valid)) in chunk.iter().enumerate() {
                        match results.get(i) {
                            Some(result) if result.status.is_good() => {
                                created.push((
                                    key.clone(),
                                    MonitoredItemHandle {
                                        monitored_item_id: result.monitored_item_id,
                                        client_handle: request.client_handle,
                                        valid: valid.clone(),
                                    },
                                ));
                            }
                            Some(result) => {
                                warn!(kind = %self.kind, key = %key, status = %result.status, "Monitored item rejected");
                                routes.remove(&request.client_handle);
                            }
                            None => {
                                warn!(kind = %self.kind, key = %key, "No result for monitored item");
                                routes.remove(&request.client_handle);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(kind = %self.kind, items = chunk.len(), error = %e, "CreateMonitoredItems failed");
                    for (_, request, _) in chunk {
                        routes.remove(&request.client_handle);
                    }
                    if e.is_fatal() && fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        (created, fatal)
    }

    /// Delete items by id, one request per chunk, chunks in parallel
    async fn delete_items(
        &self,
        subscription_id: SubscriptionId,
        ids: &[MonitoredItemId],
    ) -> Result<(), UaDriverError> {
        if ids.is_empty() {
            return Ok(());
        }
        let calls = ids
            .chunks(self.options.max_items_per_request)
            .map(|chunk| async move {
                let result = self
                    .call(self.session.delete_monitored_items(subscription_id, chunk))
                    .await;
                (chunk, result)
            });

        let mut fatal = None;
        for (chunk, response) in join_all(calls).await {
            match response {
                Ok(statuses) => {
                    for (id, status) in chunk.iter().zip(statuses) {
                        if !status.is_good() {
                            warn!(kind = %self.kind, monitored_item_id = id, status = %status, "Monitored item deletion rejected");
                        }
                    }
                }
                Err(e) => {
                    warn!(kind = %self.kind, items = chunk.len(), error = %e, "DeleteMonitoredItems failed");
                    if e.is_fatal() && fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }
        fatal.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::registry::{NodeListenParams, Registration};
    use crate::transport::mock::{MockConnector, MockSession, RecordedCall};
    use crate::transport::types::{AttributeId, Variant};
    use crate::transport::SessionConnector;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use uadrv_core::{ChannelConfig, ChannelEvent, ChannelListener, ListenerConfig, ValueType};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ChannelEvent>>,
    }

    impl ChannelListener for Recorder {
        fn on_channel_event(&self, event: ChannelEvent) {
            self.events.lock().push(event);
        }
    }

    struct Fixture {
        connector: MockConnector,
        session: Arc<MockSession>,
        registry: Arc<ListenerRegistry>,
        manager: Arc<SubscriptionManager>,
        listener: Arc<Recorder>,
        fatal: Arc<AtomicUsize>,
    }

    async fn fixture(max_items_per_request: usize) -> Fixture {
        let connector = MockConnector::new(&MockConfig::default());
        let session = connector
            .connect(&UaDriverOptions::default(), None)
            .await
            .unwrap();
        let mock = connector.latest_session().unwrap();
        let registry = Arc::new(ListenerRegistry::new(ListenKind::Node));
        let fatal = Arc::new(AtomicUsize::new(0));
        let counter = fatal.clone();
        let manager = SubscriptionManager::new(
            registry.clone(),
            session,
            SubscriptionOptions {
                publish_interval: Duration::from_millis(100),
                request_timeout: Duration::from_secs(5),
                max_items_per_request,
            },
            Uuid::new_v4(),
            Handle::current(),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Fixture {
            connector,
            session: mock,
            registry,
            manager,
            listener: Arc::new(Recorder::default()),
            fatal,
        }
    }

    fn key(name: &str) -> ListenKey {
        ListenKey::Node(NodeListenParams {
            node_id: NodeId::string(2, name),
            attribute: AttributeId::Value,
            sampling_interval: Duration::from_millis(100),
            queue_size: 10,
            discard_oldest: true,
        })
    }

    impl Fixture {
        fn register(&self, names: &[&str]) {
            let batch = names
                .iter()
                .map(|name| {
                    let registration = Registration::new(
                        self.listener.clone(),
                        ListenerConfig::new(*name, ValueType::Double, ChannelConfig::new()),
                    );
                    (key(name), registration)
                })
                .collect();
            self.registry.register(batch);
        }

        fn unregister_all(&self) {
            let listener: Arc<dyn ChannelListener> = self.listener.clone();
            self.registry.unregister(&[listener]);
        }

        async fn settle(&self) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !self.manager.is_reconciled() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();
        }

        fn count(&self, pred: impl Fn(&RecordedCall) -> bool) -> usize {
            self.connector.count_calls(pred)
        }
    }

    fn is_create_subscription(c: &RecordedCall) -> bool {
        matches!(c, RecordedCall::CreateSubscription { .. })
    }

    fn is_create_items(c: &RecordedCall) -> bool {
        matches!(c, RecordedCall::CreateMonitoredItems { .. })
    }

    fn is_delete_items(c: &RecordedCall) -> bool {
        matches!(c, RecordedCall::DeleteMonitoredItems { .. })
    }

    #[tokio::test]
    async fn test_first_registration_subscribes() {
        let f = fixture(10).await;
        assert_eq!(f.manager.state_kind(), SubscriptionStateKind::Unsubscribed);

        f.register(&["A"]);
        f.settle().await;

        assert_eq!(f.manager.state_kind(), SubscriptionStateKind::Subscribed);
        assert_eq!(f.session.monitored_nodes(), vec![NodeId::string(2, "A")]);
        assert_eq!(f.count(is_create_subscription), 1);
    }

    #[tokio::test]
    async fn test_burst_collapses_into_one_pass() {
        let f = fixture(10).await;
        f.register(&["A"]);
        f.register(&["B"]);
        f.register(&["C"]);
        f.settle().await;

        assert_eq!(f.count(is_create_subscription), 1);
        assert_eq!(f.count(is_create_items), 1);
        assert_eq!(f.manager.monitored_keys().await.len(), 3);
    }

    #[tokio::test]
    async fn test_chunks_respect_max_items_per_request() {
        let f = fixture(2).await;
        f.register(&["A", "B", "C", "D", "E"]);
        f.settle().await;

        assert_eq!(f.count(is_create_items), 3);
        assert_eq!(f.session.monitored_nodes().len(), 5);

        f.unregister_all();
        f.settle().await;
        // Subscription deletion drops its items with it
        assert_eq!(f.count(is_delete_items), 0);
        assert!(f.session.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_without_changes_is_noop() {
        let f = fixture(10).await;
        f.register(&["A", "B"]);
        f.settle().await;
        let calls = f.connector.calls().len();

        f.manager.request_reconciliation();
        f.settle().await;

        assert_eq!(f.connector.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_rejected_item_retried_on_next_pass() {
        let f = fixture(10).await;
        f.connector.reject_node(NodeId::string(2, "B"));
        f.register(&["A", "B"]);
        f.settle().await;
        assert_eq!(f.manager.monitored_keys().await, [key("A")].into_iter().collect());

        f.connector.accept_node(&NodeId::string(2, "B"));
        f.manager.request_reconciliation();
        f.settle().await;

        assert_eq!(f.manager.monitored_keys().await.len(), 2);
        assert_eq!(f.count(is_create_subscription), 1);
    }

    #[tokio::test]
    async fn test_all_items_rejected_leaves_unsubscribed() {
        let f = fixture(10).await;
        f.connector.reject_node(NodeId::string(2, "A"));
        f.register(&["A"]);
        f.settle().await;

        assert_eq!(f.manager.state_kind(), SubscriptionStateKind::Unsubscribed);
        assert!(f.session.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_invalidated_item_is_recreated() {
        let f = fixture(10).await;
        f.register(&["A", "B"]);
        f.settle().await;

        f.session.invalidate_item(&NodeId::string(2, "A"));
        let handle = f
            .manager
            .routes
            .read()
            .iter()
            .find(|(_, r)| r.key == key("A"))
            .map(|(h, _)| *h)
            .unwrap();
        f.manager.on_item_invalidated(handle);
        f.settle().await;

        assert_eq!(f.session.monitored_nodes().len(), 2);
        assert_eq!(f.count(is_create_items), 2);
        assert_eq!(f.count(is_delete_items), 0);
    }

    #[tokio::test]
    async fn test_transfer_failure_resubscribes() {
        let f = fixture(10).await;
        f.register(&["A", "B"]);
        f.settle().await;
        let first = f.manager.subscription_id().unwrap();

        f.session.fail_transfer(first);
        f.manager.on_transfer_failed(first);
        f.settle().await;

        let second = f.manager.subscription_id().unwrap();
        assert_ne!(first, second);
        assert_eq!(f.session.active_subscriptions(), vec![second]);
        assert_eq!(f.session.monitored_nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_notifications_reach_listener() {
        let f = fixture(10).await;
        f.register(&["A"]);
        f.settle().await;

        let handle = *f.manager.routes.read().keys().next().unwrap();
        f.manager
            .on_data_change(handle, &DataValue::good(Variant::Double(4.2)));

        let events = f.listener.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel_name(), "A");
        assert!(f.manager.owns(f.manager.subscription_id().unwrap()));
    }

    #[tokio::test]
    async fn test_close_tears_down_and_detaches() {
        let f = fixture(10).await;
        f.register(&["A", "B"]);
        f.settle().await;

        f.manager.close().await.unwrap().unwrap();
        assert_eq!(f.manager.state_kind(), SubscriptionStateKind::Unsubscribed);
        assert!(f.session.active_subscriptions().is_empty());
        assert_eq!(f.count(is_delete_items), 1);

        let calls = f.connector.calls().len();
        f.register(&["C"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.connector.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_fatal_error_reported() {
        let f = fixture(10).await;
        f.session.lose_connection("cable pulled");
        f.register(&["A"]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.fatal.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(f.manager.state_kind(), SubscriptionStateKind::Unsubscribed);
    }
}
