//! Data models shared between drivers and their consumers

mod channel;
mod value;

pub use channel::{ChannelConfig, ChannelEvent, ChannelFlag, ChannelRecord, ChannelStatus};
pub use value::{Value, ValueType};
