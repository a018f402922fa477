//! Server-side subscription kept in step with a listener registry
//!
//! Each [`SubscriptionManager`] owns at most one OPC UA subscription on one
//! session and mirrors one [`ListenerRegistry`](crate::registry::ListenerRegistry)
//! into monitored items. Every change to its state runs as a task on its own
//! [`SerialTaskQueue`](crate::task_queue::SerialTaskQueue).

mod manager;

pub use manager::{SubscriptionManager, SubscriptionOptions, SubscriptionStateKind};
