//! OPC UA driver facade
//!
//! [`UaDriver`] implements [`Driver`] on top of a [`ConnectionManager`].
//! It owns the listener registries, so registrations survive reconnects,
//! and it owns the reconnect policy.
//!
//! Connection attempts are shared: while one is in flight every caller
//! awaits the same future. Each attempt captures the attempt counter when
//! it starts; `disconnect` bumps the counter, and an attempt that finishes
//! under a different counter closes its session and fails with
//! [`DriverError::Cancelled`] instead of becoming active.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uadrv_core::{
    ChannelListener, ChannelRecord, Driver, DriverError, DriverResult, ListenerConfig,
    PreparedRead,
};
use uuid::Uuid;

use crate::channel;
use crate::config::{TransportConfig, UaDriverOptions};
use crate::connection::{ConnectionManager, FailureCallback};
use crate::conversion::fill_record;
use crate::credentials::{AnonymousCredentials, CredentialProvider};
use crate::error::UaDriverError;
use crate::monitor::ReconnectMonitor;
use crate::registry::{ListenKind, ListenerRegistry, Registration};
use crate::transport::types::ReadValueId;
use crate::transport::{create_connector, SessionConnector, TransportError};

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<ConnectionManager>, UaDriverError>>>;

#[derive(Default)]
struct ConnectionSlot {
    active: Option<Arc<ConnectionManager>>,
    pending: Option<ConnectFuture>,
    /// Bumped on every disconnect; attempts started under an older value are stale
    attempt: u64,
}

struct DriverInner {
    options: RwLock<UaDriverOptions>,
    connector: Arc<dyn SessionConnector>,
    credentials: Arc<dyn CredentialProvider>,
    node_registry: Arc<ListenerRegistry>,
    tree_registry: Arc<ListenerRegistry>,
    connection: Mutex<ConnectionSlot>,
    monitor: ReconnectMonitor,
    runtime: Handle,
}

/// OPC UA implementation of [`Driver`]
#[derive(Clone)]
pub struct UaDriver {
    inner: Arc<DriverInner>,
}

impl UaDriver {
    /// Create a driver; must be called from within a Tokio runtime
    pub fn new(
        options: UaDriverOptions,
        connector: Arc<dyn SessionConnector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, UaDriverError> {
        options.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| UaDriverError::Config(format!("no Tokio runtime: {}", e)))?;

        let inner = DriverInner {
            options: RwLock::new(options),
            connector,
            credentials,
            node_registry: Arc::new(ListenerRegistry::new(ListenKind::Node)),
            tree_registry: Arc::new(ListenerRegistry::new(ListenKind::Tree)),
            connection: Mutex::new(ConnectionSlot::default()),
            monitor: ReconnectMonitor::new(runtime.clone()),
            runtime,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Create a driver over a configured transport with no client identity
    pub fn with_transport(
        options: UaDriverOptions,
        transport: &TransportConfig,
    ) -> Result<Self, UaDriverError> {
        Self::new(options, create_connector(transport)?, Arc::new(AnonymousCredentials))
    }

    pub fn options(&self) -> UaDriverOptions {
        self.inner.options.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().active.is_some()
    }

    /// Id of the active connection, if any
    pub fn connection_id(&self) -> Option<Uuid> {
        self.inner.connection.lock().active.as_ref().map(|c| c.id())
    }

    pub fn active_connection(&self) -> Option<Arc<ConnectionManager>> {
        self.inner.connection.lock().active.clone()
    }

    pub fn is_monitor_running(&self) -> bool {
        self.inner.monitor.is_running()
    }

    pub fn registry(&self, kind: ListenKind) -> &Arc<ListenerRegistry> {
        self.inner.registry(kind)
    }

    /// Replace the options
    ///
    /// The current connection is dropped. If listeners remain registered a
    /// new connection attempt and the reconnect monitor are started.
    pub async fn update_options(&self, options: UaDriverOptions) -> DriverResult<()> {
        options.validate()?;
        self.inner.reset(Some(options)).await;
        info!("Driver options updated");

        if !self.inner.node_registry.is_empty() || !self.inner.tree_registry.is_empty() {
            let _ = self.inner.connection_future();
            self.inner.start_monitor();
        }
        Ok(())
    }
}

impl DriverInner {
    fn registry(&self, kind: ListenKind) -> &Arc<ListenerRegistry> {
        match kind {
            ListenKind::Node => &self.node_registry,
            ListenKind::Tree => &self.tree_registry,
        }
    }

    /// The active connection, the attempt in flight, or a new attempt
    ///
    /// New attempts are spawned so they complete even if every caller
    /// stops waiting.
    fn connection_future(self: &Arc<Self>) -> ConnectFuture {
        let mut slot = self.connection.lock();
        if let Some(active) = &slot.active {
            let active = active.clone();
            return futures::future::ready(Ok(active)).boxed().shared();
        }
        if let Some(pending) = &slot.pending {
            return pending.clone();
        }

        // Options are captured under the slot lock so an attempt never
        // outlives the options it was started with without becoming stale
        let token = slot.attempt;
        let options = self.options.read().clone();
        let this = self.clone();
        let attempt = async move { this.establish(token, options).await }
            .boxed()
            .shared();
        slot.pending = Some(attempt.clone());
        self.runtime.spawn(attempt.clone().map(|_| ()));
        debug!(token, "Connection attempt started");
        attempt
    }

    async fn establish(
        self: Arc<Self>,
        token: u64,
        options: UaDriverOptions,
    ) -> Result<Arc<ConnectionManager>, UaDriverError> {
        let registries = [self.node_registry.clone(), self.tree_registry.clone()];
        let result = ConnectionManager::connect(
            options,
            self.connector.clone(),
            self.credentials.clone(),
            self.failure_callback(),
            &registries,
        )
        .await;

        let manager = match result {
            Ok(manager) => manager,
            Err(e) => {
                warn!(token, error = %e, "Connection attempt failed");
                let mut slot = self.connection.lock();
                if slot.attempt == token {
                    slot.pending = None;
                }
                return Err(e);
            }
        };

        self.install(token, manager).await
    }

    /// Make `manager` the active connection if attempt `token` is current
    ///
    /// A manager that already reported a failure is closed instead: its
    /// report was ignored because it was not active yet, and it will not
    /// report again.
    async fn install(
        &self,
        token: u64,
        manager: Arc<ConnectionManager>,
    ) -> Result<Arc<ConnectionManager>, UaDriverError> {
        let rejection = {
            let mut slot = self.connection.lock();
            if slot.attempt != token {
                Some(UaDriverError::Stale)
            } else if manager.has_failed() {
                slot.pending = None;
                Some(UaDriverError::Transport(TransportError::ConnectionClosed))
            } else {
                slot.pending = None;
                slot.active = Some(manager.clone());
                None
            }
        };
        match rejection {
            None => Ok(manager),
            Some(e) => {
                info!(connection_id = %manager.id(), token, error = %e, "Discarding connection attempt");
                manager.close().await;
                Err(e)
            }
        }
    }

    /// Connection for a caller, bounded by the connect timeout
    async fn connected(self: &Arc<Self>) -> Result<Arc<ConnectionManager>, DriverError> {
        let limit = self.options.read().connect_timeout();
        match tokio::time::timeout(limit, self.connection_future()).await {
            Ok(result) => result.map_err(DriverError::from),
            Err(_) => Err(DriverError::Timeout(limit)),
        }
    }

    async fn disconnect(&self) {
        self.reset(None).await;
    }

    /// Invalidate every attempt, drop the active connection and stop the
    /// monitor, swapping in `replacement` options in the same step
    async fn reset(&self, replacement: Option<UaDriverOptions>) {
        let active = {
            let mut slot = self.connection.lock();
            if let Some(options) = replacement {
                *self.options.write() = options;
            }
            slot.attempt += 1;
            slot.pending = None;
            slot.active.take()
        };
        self.monitor.stop();
        if let Some(connection) = active {
            info!(connection_id = %connection.id(), "Disconnecting");
            connection.close().await;
        }
    }

    /// Drop `expected` if it is still the active connection
    ///
    /// Returns the attempt counter current after the drop, or `None` if
    /// `expected` was no longer active.
    async fn drop_connection(&self, expected: &Arc<ConnectionManager>) -> Option<u64> {
        let (taken, attempt) = {
            let mut slot = self.connection.lock();
            match &slot.active {
                Some(active) if Arc::ptr_eq(active, expected) => {
                    slot.attempt += 1;
                    slot.pending = None;
                    (slot.active.take(), slot.attempt)
                }
                _ => return None,
            }
        };
        if let Some(connection) = taken {
            connection.close().await;
        }
        Some(attempt)
    }

    /// Restart the monitor unless a disconnect happened after `attempt`
    fn restart_monitor_since(self: &Arc<Self>, attempt: u64) -> bool {
        // Held across the start so a concurrent disconnect stops what we start
        let slot = self.connection.lock();
        if slot.attempt != attempt {
            return false;
        }
        self.monitor.stop();
        self.start_monitor();
        drop(slot);
        true
    }

    fn failure_callback(self: &Arc<Self>) -> FailureCallback {
        let weak: Weak<DriverInner> = Arc::downgrade(self);
        Arc::new(move |manager: &Arc<ConnectionManager>, cause: UaDriverError| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let is_active = inner
                .connection
                .lock()
                .active
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, manager));
            if !is_active {
                debug!(connection_id = %manager.id(), error = %cause, "Failure of inactive connection ignored");
                return;
            }

            warn!(connection_id = %manager.id(), error = %cause, "Active connection failed, reconnecting");
            let expected = manager.clone();
            let runtime = inner.runtime.clone();
            runtime.spawn(async move {
                let Some(attempt) = inner.drop_connection(&expected).await else {
                    return;
                };
                if !inner.restart_monitor_since(attempt) {
                    debug!(connection_id = %expected.id(), "Disconnected during failure handling, not reconnecting");
                }
            });
        })
    }

    fn start_monitor(self: &Arc<Self>) {
        let (interval, max_retries) = {
            let options = self.options.read();
            (options.reconnect_interval(), options.max_connect_retries)
        };
        let weak = Arc::downgrade(self);
        self.monitor.start(interval, max_retries, move || {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade().ok_or(UaDriverError::NotConnected)?;
                if inner.connection.lock().active.is_some() {
                    return Ok(());
                }
                let attempt = inner.connection_future();
                drop(inner);
                attempt.await.map(|_| ())
            }
            .boxed()
        });
    }
}

impl Drop for DriverInner {
    fn drop(&mut self) {
        self.monitor.stop();
        if let Some(connection) = self.connection.get_mut().active.take() {
            self.runtime.spawn(async move { connection.close().await });
        }
    }
}

#[async_trait]
impl Driver for UaDriver {
    async fn connect(&self) -> DriverResult<()> {
        self.inner.connected().await.map(|_| ())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.inner.disconnect().await;
        Ok(())
    }

    async fn read(&self, records: &mut [ChannelRecord]) -> DriverResult<()> {
        let mut targets = Vec::with_capacity(records.len());
        let mut indices = Vec::with_capacity(records.len());
        for (i, record) in records.iter_mut().enumerate() {
            match channel::read_value_id(&record.config) {
                Ok(target) => {
                    targets.push(target);
                    indices.push(i);
                }
                Err(e) => record.set_failure(e.to_string()),
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let connection = self.inner.connected().await?;
        let values = connection.read(&targets).await?;
        for (i, value) in indices.into_iter().zip(values.iter()) {
            fill_record(&mut records[i], value);
        }
        Ok(())
    }

    async fn write(&self, records: &mut [ChannelRecord]) -> DriverResult<()> {
        let mut writes = Vec::with_capacity(records.len());
        let mut indices = Vec::with_capacity(records.len());
        for (i, record) in records.iter_mut().enumerate() {
            match channel::write_value(record) {
                Ok(write) => {
                    writes.push(write);
                    indices.push(i);
                }
                Err(e) => record.set_failure(e.to_string()),
            }
        }
        if writes.is_empty() {
            return Ok(());
        }

        let connection = self.inner.connected().await?;
        let statuses = connection.write(&writes).await?;
        for (i, status) in indices.into_iter().zip(statuses) {
            if status.is_good() {
                records[i].set_success();
            } else {
                records[i].set_failure(status.to_string());
            }
        }
        Ok(())
    }

    fn register_channel_listeners(
        &self,
        listeners: Vec<(Arc<dyn ChannelListener>, ListenerConfig)>,
    ) -> DriverResult<()> {
        let mut node_batch = Vec::new();
        let mut tree_batch = Vec::new();
        for (listener, config) in listeners {
            let key = channel::listen_key(&config.config).map_err(|e| {
                DriverError::InvalidChannel(format!("{}: {}", config.channel_name, e))
            })?;
            let batch = match key.kind() {
                ListenKind::Node => &mut node_batch,
                ListenKind::Tree => &mut tree_batch,
            };
            batch.push((key, Registration::new(listener, config)));
        }

        debug!(
            nodes = node_batch.len(),
            trees = tree_batch.len(),
            "Registering channel listeners"
        );
        self.inner.node_registry.register(node_batch);
        self.inner.tree_registry.register(tree_batch);

        let _ = self.inner.connection_future();
        self.inner.start_monitor();
        Ok(())
    }

    fn unregister_channel_listeners(
        &self,
        listeners: &[Arc<dyn ChannelListener>],
    ) -> DriverResult<()> {
        let removed = self.inner.node_registry.unregister(listeners)
            + self.inner.tree_registry.unregister(listeners);
        debug!(removed, "Unregistered channel listeners");
        Ok(())
    }

    fn prepare_read(&self, records: Vec<ChannelRecord>) -> DriverResult<Box<dyn PreparedRead>> {
        let targets = records
            .iter()
            .map(|record| {
                channel::read_value_id(&record.config).map_err(|e| {
                    DriverError::InvalidChannel(format!("{}: {}", record.channel_name, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(UaPreparedRead {
            driver: self.inner.clone(),
            records,
            targets,
        }))
    }
}

/// Reusable read with channel addresses resolved up front
pub struct UaPreparedRead {
    driver: Arc<DriverInner>,
    records: Vec<ChannelRecord>,
    targets: Vec<ReadValueId>,
}

#[async_trait]
impl PreparedRead for UaPreparedRead {
    async fn execute(&mut self) -> DriverResult<()> {
        if self.targets.is_empty() {
            return Ok(());
        }
        let connection = self.driver.connected().await?;
        let values = connection.read(&self.targets).await?;
        for (record, value) in self.records.iter_mut().zip(values.iter()) {
            fill_record(record, value);
        }
        Ok(())
    }

    fn records(&self) -> &[ChannelRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockConnector;
    use std::time::Duration;
    use uadrv_core::{ChannelConfig, Value, ValueType};

    fn driver(connector: &MockConnector) -> UaDriver {
        UaDriver::new(
            UaDriverOptions::default(),
            Arc::new(connector.clone()),
            Arc::new(AnonymousCredentials),
        )
        .unwrap()
    }

    fn config(node: &str) -> ChannelConfig {
        ChannelConfig::from([(channel::NODE_ID.to_string(), node.to_string())])
    }

    #[tokio::test]
    async fn test_read_marks_bad_channels_individually() {
        let connector = MockConnector::new(&MockConfig::default());
        let driver = driver(&connector);

        let mut records = vec![
            ChannelRecord::read("temp", ValueType::Double, config("ns=2;s=Demo.Temperature")),
            ChannelRecord::read("broken", ValueType::Double, config("garbage")),
            ChannelRecord::read("missing", ValueType::Double, config("ns=2;s=Nope")),
        ];
        driver.read(&mut records).await.unwrap();

        assert_eq!(records[0].value, Some(Value::Double(21.5)));
        assert!(!records[1].is_success());
        assert!(!records[2].is_success());
        assert!(driver.is_connected());
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let connector = MockConnector::new(&MockConfig::default());
        let driver = driver(&connector);

        let mut writes = vec![ChannelRecord::write(
            "counter",
            Value::Integer(41),
            config("ns=2;s=Demo.Counter"),
        )];
        driver.write(&mut writes).await.unwrap();
        assert!(writes[0].is_success());

        let mut reads = vec![ChannelRecord::read(
            "counter",
            ValueType::Long,
            config("ns=2;s=Demo.Counter"),
        )];
        driver.read(&mut reads).await.unwrap();
        assert_eq!(reads[0].value, Some(Value::Long(41)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let connector = MockConnector::new(&MockConfig::default());
        connector.fail_all_connects(true);
        let driver = driver(&connector);

        let err = driver.connect().await.unwrap_err();
        assert!(matches!(err, DriverError::Connection(msg) if msg.contains("refused")));
        assert!(!driver.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let connector = MockConnector::new(&MockConfig::default());
        connector.hold_connects(true);
        let driver = driver(&connector);

        let err = driver.connect().await.unwrap_err();
        assert_eq!(err, DriverError::Timeout(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_invalid_listener_config_registers_nothing() {
        let connector = MockConnector::new(&MockConfig::default());
        let driver = driver(&connector);

        struct Nop;
        impl ChannelListener for Nop {
            fn on_channel_event(&self, _event: uadrv_core::ChannelEvent) {}
        }
        let listener: Arc<dyn ChannelListener> = Arc::new(Nop);
        let err = driver
            .register_channel_listeners(vec![
                (
                    listener.clone(),
                    ListenerConfig::new("ok", ValueType::Double, config("ns=2;s=A")),
                ),
                (
                    listener,
                    ListenerConfig::new("bad", ValueType::Double, ChannelConfig::new()),
                ),
            ])
            .unwrap_err();

        assert!(matches!(err, DriverError::InvalidChannel(msg) if msg.starts_with("bad")));
        assert!(driver.registry(ListenKind::Node).is_empty());
        assert_eq!(connector.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_prepared_read_reexecutes() {
        let connector = MockConnector::new(&MockConfig::default());
        let driver = driver(&connector);

        let mut prepared = driver
            .prepare_read(vec![ChannelRecord::read(
                "counter",
                ValueType::Integer,
                config("ns=2;s=Demo.Counter"),
            )])
            .unwrap();
        prepared.execute().await.unwrap();
        assert_eq!(prepared.records()[0].value, Some(Value::Integer(0)));

        connector.set_value(
            crate::transport::types::NodeId::string(2, "Demo.Counter"),
            crate::transport::types::Variant::Int32(9),
        );
        prepared.execute().await.unwrap();
        assert_eq!(prepared.records()[0].value, Some(Value::Integer(9)));

        assert!(driver
            .prepare_read(vec![ChannelRecord::read("x", ValueType::Integer, ChannelConfig::new())])
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_manager_is_not_installed() {
        let connector = MockConnector::new(&MockConfig::default());
        let driver = driver(&connector);
        let inner = &driver.inner;

        let manager = ConnectionManager::connect(
            driver.options(),
            Arc::new(connector.clone()),
            Arc::new(AnonymousCredentials),
            inner.failure_callback(),
            &[inner.node_registry.clone(), inner.tree_registry.clone()],
        )
        .await
        .unwrap();
        // Not active yet, so the driver ignores the report
        manager.report_failure(TransportError::ConnectionClosed.into());
        assert!(manager.has_failed());

        let token = inner.connection.lock().attempt;
        let err = inner.install(token, manager.clone()).await.unwrap_err();

        assert!(matches!(err, UaDriverError::Transport(TransportError::ConnectionClosed)));
        assert!(manager.is_closed());
        assert!(!driver.is_connected());
        assert!(connector.latest_session().unwrap().is_closed());

        // The next attempt starts from scratch
        driver.connect().await.unwrap();
        assert_eq!(connector.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_manager_is_not_installed() {
        let connector = MockConnector::new(&MockConfig::default());
        let driver = driver(&connector);
        let inner = &driver.inner;

        let token = inner.connection.lock().attempt;
        let manager = ConnectionManager::connect(
            driver.options(),
            Arc::new(connector.clone()),
            Arc::new(AnonymousCredentials),
            inner.failure_callback(),
            &[],
        )
        .await
        .unwrap();
        driver.disconnect().await.unwrap();

        let err = inner.install(token, manager.clone()).await.unwrap_err();
        assert!(matches!(err, UaDriverError::Stale));
        assert!(manager.is_closed());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_options() {
        let connector = MockConnector::new(&MockConfig::default());
        let result = UaDriver::new(
            UaDriverOptions {
                endpoint_url: String::new(),
                ..Default::default()
            },
            Arc::new(connector),
            Arc::new(AnonymousCredentials),
        );
        assert!(matches!(result, Err(UaDriverError::Config(_))));
    }
}
