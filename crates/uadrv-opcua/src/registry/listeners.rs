//! Registry of requested listen keys and their dispatchers

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};
use uadrv_core::{ChannelEvent, ChannelListener, ChannelRecord, ListenerConfig};

use super::{ListenKey, ListenKind};
use crate::channel;
use crate::conversion::fill_record;
use crate::transport::types::{DataValue, NodeId};

/// A listener and the channel it registered for
#[derive(Clone)]
pub struct Registration {
    pub listener: Arc<dyn ChannelListener>,
    pub config: ListenerConfig,
}

impl Registration {
    pub fn new(listener: Arc<dyn ChannelListener>, config: ListenerConfig) -> Self {
        Self { listener, config }
    }

    fn targets(&self, listener: &Arc<dyn ChannelListener>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.listener), Arc::as_ptr(listener))
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("channel", &self.config.channel_name)
            .finish_non_exhaustive()
    }
}

/// Notified after every registry mutation
pub trait RegistryObserver: Send + Sync {
    fn registry_changed(&self, kind: ListenKind);
}

/// Desired set of listen keys for one listen kind
pub struct ListenerRegistry {
    kind: ListenKind,
    entries: RwLock<HashMap<ListenKey, Registration>>,
    observers: RwLock<Vec<Arc<dyn RegistryObserver>>>,
}

impl ListenerRegistry {
    pub fn new(kind: ListenKind) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> ListenKind {
        self.kind
    }

    /// Add a batch of registrations
    ///
    /// A key that is already present keeps its slot but dispatches to the
    /// new registration from now on. Observers are notified once per batch.
    pub fn register(&self, batch: Vec<(ListenKey, Registration)>) {
        if batch.is_empty() {
            return;
        }
        {
            let mut entries = self.entries.write();
            for (key, registration) in batch {
                debug_assert_eq!(key.kind(), self.kind);
                trace!(kind = %self.kind, key = %key, channel = %registration.config.channel_name, "Registered");
                entries.insert(key, registration);
            }
        }
        self.notify();
    }

    /// Remove every registration dispatching to one of `listeners`
    ///
    /// Returns the number of keys removed. Observers are notified only when
    /// something was removed.
    pub fn unregister(&self, listeners: &[Arc<dyn ChannelListener>]) -> usize {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, registration| !listeners.iter().any(|l| registration.targets(l)));
            before - entries.len()
        };
        if removed > 0 {
            debug!(kind = %self.kind, removed, "Unregistered listeners");
            self.notify();
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn keys(&self) -> HashSet<ListenKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Diff the current keys against `previous` under one snapshot
    ///
    /// The callbacks run while the registry is read-locked and must not call
    /// back into it.
    pub fn compute_differences(
        &self,
        previous: &HashSet<ListenKey>,
        mut on_added: impl FnMut(&ListenKey),
        mut on_removed: impl FnMut(&ListenKey),
    ) {
        let entries = self.entries.read();
        for key in entries.keys() {
            if !previous.contains(key) {
                on_added(key);
            }
        }
        for key in previous {
            if !entries.contains_key(key) {
                on_removed(key);
            }
        }
    }

    /// Deliver a notification to the listener currently bound to `key`
    ///
    /// For tree keys `source` is the node that raised the event; the record
    /// handed to the listener carries it as its `node.id`. Returns `false`
    /// when no registration exists for `key`.
    pub fn dispatch(&self, key: &ListenKey, value: &DataValue, source: Option<&NodeId>) -> bool {
        let Some(registration) = self.entries.read().get(key).cloned() else {
            return false;
        };

        let mut config = registration.config.config.clone();
        if let Some(source) = source {
            config.insert(channel::NODE_ID.to_string(), source.to_string());
        }
        let mut record = ChannelRecord::read(
            registration.config.channel_name.clone(),
            registration.config.value_type,
            config,
        );
        fill_record(&mut record, value);
        registration.listener.on_channel_event(ChannelEvent::new(record));
        true
    }

    pub fn add_observer(&self, observer: Arc<dyn RegistryObserver>) {
        self.observers.write().push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn RegistryObserver>) {
        self.observers
            .write()
            .retain(|o| !std::ptr::addr_eq(Arc::as_ptr(o), Arc::as_ptr(observer)));
    }

    fn notify(&self) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.registry_changed(self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeListenParams;
    use crate::transport::types::{AttributeId, StatusCode, Variant};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uadrv_core::{ChannelConfig, Value, ValueType};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ChannelEvent>>,
    }

    impl ChannelListener for Recorder {
        fn on_channel_event(&self, event: ChannelEvent) {
            self.events.lock().push(event);
        }
    }

    #[derive(Default)]
    struct CountingObserver(AtomicUsize);

    impl RegistryObserver for CountingObserver {
        fn registry_changed(&self, _kind: ListenKind) {
            self.0.fetch_add(1, Ordering::SeqCst);
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

    fn registration(listener: &Arc<Recorder>, channel: &str) -> Registration {
        Registration::new(
            listener.clone(),
            ListenerConfig::new(channel, ValueType::Double, ChannelConfig::new()),
        )
    }

    #[test]
    fn test_compute_differences() {
        let registry = ListenerRegistry::new(ListenKind::Node);
        let listener = Arc::new(Recorder::default());
        registry.register(vec![
            (key("A"), registration(&listener, "a")),
            (key("B"), registration(&listener, "b")),
        ]);

        let previous: HashSet<_> = [key("B"), key("C")].into_iter().collect();
        let mut added = Vec::new();
        let mut removed = Vec::new();
        registry.compute_differences(&previous, |k| added.push(k.clone()), |k| {
            removed.push(k.clone())
        });

        assert_eq!(added, vec![key("A")]);
        assert_eq!(removed, vec![key("C")]);
    }

    #[test]
    fn test_same_key_dispatches_to_latest() {
        let registry = ListenerRegistry::new(ListenKind::Node);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        registry.register(vec![(key("A"), registration(&first, "first"))]);
        registry.register(vec![(key("A"), registration(&second, "second"))]);
        assert_eq!(registry.len(), 1);

        assert!(registry.dispatch(&key("A"), &DataValue::good(Variant::Double(1.5)), None));
        assert!(first.events.lock().is_empty());
        let events = second.events.lock();
        assert_eq!(events[0].channel_name(), "second");
        assert_eq!(events[0].record.value, Some(Value::Double(1.5)));
    }

    #[test]
    fn test_unregister_by_listener_identity() {
        let registry = ListenerRegistry::new(ListenKind::Node);
        let observer = Arc::new(CountingObserver::default());
        registry.add_observer(observer.clone());

        let kept = Arc::new(Recorder::default());
        let dropped = Arc::new(Recorder::default());
        registry.register(vec![
            (key("A"), registration(&dropped, "a")),
            (key("B"), registration(&kept, "b")),
            (key("C"), registration(&dropped, "c")),
        ]);

        let target: Arc<dyn ChannelListener> = dropped.clone();
        assert_eq!(registry.unregister(&[target.clone()]), 2);
        assert_eq!(registry.keys(), [key("B")].into_iter().collect());

        // Nothing left to remove, so no notification
        assert_eq!(registry.unregister(&[target]), 0);
        assert_eq!(observer.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_removed_observer_not_notified() {
        let registry = ListenerRegistry::new(ListenKind::Node);
        let observer = Arc::new(CountingObserver::default());
        let as_dyn: Arc<dyn RegistryObserver> = observer.clone();
        registry.add_observer(as_dyn.clone());
        registry.remove_observer(&as_dyn);

        let listener = Arc::new(Recorder::default());
        registry.register(vec![(key("A"), registration(&listener, "a"))]);
        assert_eq!(observer.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispatch_with_source_and_bad_status() {
        let registry = ListenerRegistry::new(ListenKind::Node);
        let listener = Arc::new(Recorder::default());
        registry.register(vec![(key("A"), registration(&listener, "a"))]);

        let source = NodeId::string(2, "Line1.Pump");
        registry.dispatch(
            &key("A"),
            &DataValue::bad(StatusCode::BAD_TIMEOUT),
            Some(&source),
        );

        let events = listener.events.lock();
        let record = &events[0].record;
        assert!(!record.is_success());
        assert_eq!(record.config.get(channel::NODE_ID).unwrap(), "ns=2;s=Line1.Pump");
        assert!(!registry.dispatch(&key("Z"), &DataValue::good(Variant::Empty), None));
    }
}
