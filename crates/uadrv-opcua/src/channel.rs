//! Channel configuration parsing
//!
//! Channels address the server through a string map. Recognized keys:
//!
//! | key                             | default | meaning                          |
//! |---------------------------------|---------|----------------------------------|
//! | `node.id`                       | -       | `ns=<n>;i=<num>` or `ns=<n>;s=<text>` |
//! | `attribute`                     | `Value` | node attribute to read/monitor   |
//! | `listen.sampling.interval`      | `1000`  | sampling interval in ms          |
//! | `listen.queue.size`             | `10`    | server-side queue size           |
//! | `listen.discard.oldest`         | `true`  | queue overflow policy            |
//! | `listen.subscribe.to.children`  | `false` | monitor events below the node    |

use std::time::Duration;

use thiserror::Error;
use uadrv_core::{ChannelConfig, ChannelRecord};

use crate::conversion::to_variant;
use crate::registry::{ListenKey, NodeListenParams, TreeListenParams};
use crate::transport::types::{AttributeId, InvalidNodeId, NodeId, ReadValueId, WriteValue};

pub const NODE_ID: &str = "node.id";
pub const ATTRIBUTE: &str = "attribute";
pub const SAMPLING_INTERVAL: &str = "listen.sampling.interval";
pub const QUEUE_SIZE: &str = "listen.queue.size";
pub const DISCARD_OLDEST: &str = "listen.discard.oldest";
pub const SUBSCRIBE_TO_CHILDREN: &str = "listen.subscribe.to.children";

const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 1000;
const DEFAULT_QUEUE_SIZE: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelConfigError {
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),

    #[error(transparent)]
    InvalidNodeId(#[from] InvalidNodeId),

    #[error("unknown attribute '{0}'")]
    InvalidAttribute(String),

    #[error("'{key}' is not a valid number: {value}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("'{key}' is not a valid boolean: {value}")]
    InvalidBool { key: &'static str, value: String },

    #[error("write to channel '{0}' has no value")]
    MissingValue(String),
}

/// The node id a channel addresses
pub fn node_id(config: &ChannelConfig) -> Result<NodeId, ChannelConfigError> {
    let raw = config
        .get(NODE_ID)
        .ok_or(ChannelConfigError::MissingKey(NODE_ID))?;
    Ok(raw.parse()?)
}

/// The attribute a channel addresses (`Value` when absent)
pub fn attribute(config: &ChannelConfig) -> Result<AttributeId, ChannelConfigError> {
    match config.get(ATTRIBUTE) {
        Some(raw) => raw.parse().map_err(ChannelConfigError::InvalidAttribute),
        None => Ok(AttributeId::Value),
    }
}

/// Resolve a channel to the node attribute it reads
pub fn read_value_id(config: &ChannelConfig) -> Result<ReadValueId, ChannelConfigError> {
    Ok(ReadValueId {
        node_id: node_id(config)?,
        attribute: attribute(config)?,
    })
}

/// Resolve a write record into the value to send
pub fn write_value(record: &ChannelRecord) -> Result<WriteValue, ChannelConfigError> {
    let target = read_value_id(&record.config)?;
    let value = record
        .value
        .as_ref()
        .ok_or_else(|| ChannelConfigError::MissingValue(record.channel_name.clone()))?;
    Ok(WriteValue {
        node_id: target.node_id,
        attribute: target.attribute,
        value: to_variant(value),
    })
}

/// Resolve a listened channel into its registry key
pub fn listen_key(config: &ChannelConfig) -> Result<ListenKey, ChannelConfigError> {
    let node_id = node_id(config)?;
    let sampling_interval = Duration::from_millis(parse_number(
        config,
        SAMPLING_INTERVAL,
        DEFAULT_SAMPLING_INTERVAL_MS,
    )?);
    let queue_size = parse_number(config, QUEUE_SIZE, DEFAULT_QUEUE_SIZE)?;
    let discard_oldest = parse_bool(config, DISCARD_OLDEST, true)?;

    if parse_bool(config, SUBSCRIBE_TO_CHILDREN, false)? {
        return Ok(ListenKey::Tree(TreeListenParams {
            root: node_id,
            sampling_interval,
            queue_size,
            discard_oldest,
        }));
    }

    Ok(ListenKey::Node(NodeListenParams {
        node_id,
        attribute: attribute(config)?,
        sampling_interval,
        queue_size,
        discard_oldest,
    }))
}

fn parse_number<T: std::str::FromStr>(
    config: &ChannelConfig,
    key: &'static str,
    default: T,
) -> Result<T, ChannelConfigError> {
    match config.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ChannelConfigError::InvalidNumber {
            key,
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(
    config: &ChannelConfig,
    key: &'static str,
    default: bool,
) -> Result<bool, ChannelConfigError> {
    match config.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" => Ok(true),
        Some(v) if v == "false" => Ok(false),
        Some(v) => Err(ChannelConfigError::InvalidBool { key, value: v }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use uadrv_core::Value;

    fn config(pairs: &[(&str, &str)]) -> ChannelConfig {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_listen_key_defaults() {
        let key = listen_key(&config(&[(NODE_ID, "ns=2;s=Boiler.Temp")])).unwrap();
        assert_eq!(
            key,
            ListenKey::Node(NodeListenParams {
                node_id: NodeId::string(2, "Boiler.Temp"),
                attribute: AttributeId::Value,
                sampling_interval: Duration::from_secs(1),
                queue_size: 10,
                discard_oldest: true,
            })
        );
    }

    #[test]
    fn test_listen_key_tree() {
        let key = listen_key(&config(&[
            (NODE_ID, "ns=2;s=Line1"),
            (SUBSCRIBE_TO_CHILDREN, "TRUE"),
            (SAMPLING_INTERVAL, "250"),
        ]))
        .unwrap();
        match key {
            ListenKey::Tree(params) => {
                assert_eq!(params.root, NodeId::string(2, "Line1"));
                assert_eq!(params.sampling_interval, Duration::from_millis(250));
            }
            other => panic!("Expected tree key, got {:?}", other),
        }
    }

    #[rstest]
    #[case(&[], ChannelConfigError::MissingKey(NODE_ID))]
    #[case(
        &[(NODE_ID, "ns=2;s=X"), (SAMPLING_INTERVAL, "fast")],
        ChannelConfigError::InvalidNumber { key: SAMPLING_INTERVAL, value: "fast".into() }
    )]
    #[case(
        &[(NODE_ID, "ns=2;s=X"), (DISCARD_OLDEST, "maybe")],
        ChannelConfigError::InvalidBool { key: DISCARD_OLDEST, value: "maybe".into() }
    )]
    #[case(
        &[(NODE_ID, "ns=2;s=X"), (ATTRIBUTE, "Historizing")],
        ChannelConfigError::InvalidAttribute("Historizing".into())
    )]
    fn test_listen_key_errors(
        #[case] pairs: &[(&str, &str)],
        #[case] expected: ChannelConfigError,
    ) {
        assert_eq!(listen_key(&config(pairs)), Err(expected));
    }

    #[test]
    fn test_write_value_requires_value() {
        let mut record = ChannelRecord::write(
            "setpoint",
            Value::Double(42.0),
            config(&[(NODE_ID, "ns=2;s=Setpoint")]),
        );
        let write = write_value(&record).unwrap();
        assert_eq!(write.node_id, NodeId::string(2, "Setpoint"));

        record.value = None;
        assert_eq!(
            write_value(&record),
            Err(ChannelConfigError::MissingValue("setpoint".into()))
        );
    }
}
