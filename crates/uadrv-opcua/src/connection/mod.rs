//! One live OPC UA session and the subscriptions riding on it

mod manager;

pub use manager::{ConnectionManager, FailureCallback};
