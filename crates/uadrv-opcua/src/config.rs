//! OPC UA driver configuration
//!
//! [`UaDriverOptions`] is what the driver consumes once the surrounding
//! framework has loaded it. Every field has a default so a partial TOML or
//! JSON document yields a usable configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::UaDriverError;

/// Message security policy negotiated for the secure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    #[default]
    None,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
}

impl SecurityPolicy {
    /// Policy URI as advertised in endpoint descriptions
    pub fn uri(&self) -> &'static str {
        match self {
            SecurityPolicy::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            SecurityPolicy::Basic256Sha256 => {
                "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
            }
            SecurityPolicy::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
        }
    }
}

/// Message security mode for the secure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

/// Options for one OPC UA driver instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UaDriverOptions {
    /// Server endpoint (e.g., "opc.tcp://plc:4840")
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,
    #[serde(default = "default_application_name")]
    pub application_name: String,
    #[serde(default = "default_application_uri")]
    pub application_uri: String,
    #[serde(default)]
    pub security_policy: SecurityPolicy,
    #[serde(default)]
    pub security_mode: SecurityMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Bound on every service call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Session timeout requested from the server
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Bound on `connect()` waiting for the shared attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Consecutive reconnect failures tolerated before the monitor stops
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,
    /// Period of the reconnect monitor
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Largest batch of monitored items per create/delete request
    #[serde(default = "default_max_items_per_request")]
    pub max_items_per_request: usize,
    /// Requested subscription publishing interval
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
    /// Use `endpoint_url` even if discovery returns a different host
    #[serde(default)]
    pub force_endpoint_url: bool,
}

fn default_endpoint_url() -> String {
    "opc.tcp://localhost:4840".to_string()
}

fn default_application_name() -> String {
    "uadrv".to_string()
}

fn default_application_uri() -> String {
    "urn:uadrv:client".to_string()
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_session_timeout_ms() -> u64 {
    120_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_connect_retries() -> u32 {
    3
}

fn default_reconnect_interval_ms() -> u64 {
    10_000
}

fn default_max_items_per_request() -> usize {
    10
}

fn default_publish_interval_ms() -> u64 {
    1_000
}

impl Default for UaDriverOptions {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            application_name: default_application_name(),
            application_uri: default_application_uri(),
            security_policy: SecurityPolicy::default(),
            security_mode: SecurityMode::default(),
            username: None,
            password: None,
            request_timeout_ms: default_request_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_connect_retries: default_max_connect_retries(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_items_per_request: default_max_items_per_request(),
            publish_interval_ms: default_publish_interval_ms(),
            force_endpoint_url: false,
        }
    }
}

impl UaDriverOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    /// Parse options from a TOML document
    pub fn from_toml(input: &str) -> Result<Self, UaDriverError> {
        let options: Self =
            toml::from_str(input).map_err(|e| UaDriverError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reject option combinations the driver cannot work with
    pub fn validate(&self) -> Result<(), UaDriverError> {
        if self.endpoint_url.trim().is_empty() {
            return Err(UaDriverError::Config("endpoint_url must not be empty".into()));
        }
        let endpoint = Url::parse(&self.endpoint_url).map_err(|e| {
            UaDriverError::Config(format!("endpoint_url {:?} is invalid: {}", self.endpoint_url, e))
        })?;
        if endpoint.scheme() != "opc.tcp" {
            return Err(UaDriverError::Config(format!(
                "endpoint_url {:?} must use the opc.tcp scheme",
                self.endpoint_url
            )));
        }
        if endpoint.host_str().map_or(true, str::is_empty) {
            return Err(UaDriverError::Config(format!(
                "endpoint_url {:?} has no host",
                self.endpoint_url
            )));
        }
        if self.max_items_per_request == 0 {
            return Err(UaDriverError::Config(
                "max_items_per_request must be at least 1".into(),
            ));
        }
        if self.publish_interval_ms == 0 {
            return Err(UaDriverError::Config(
                "publish_interval_ms must be greater than zero".into(),
            ));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(UaDriverError::Config(
                "reconnect_interval_ms must be greater than zero".into(),
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(UaDriverError::Config(
                "username and password must be given together".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Which session connector backs the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// OPC UA client stack (requires the `opcua` feature)
    Opcua(OpcuaConfig),
    /// In-process simulated server
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// OPC UA client stack configuration
///
/// Endpoint, security and user credentials come from [`UaDriverOptions`];
/// this only covers what the client stack keeps on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcuaConfig {
    /// Directory holding the application instance certificate and trust lists
    #[serde(default = "default_pki_dir")]
    pub pki_dir: PathBuf,
    /// Generate a self-signed application certificate if none exists
    #[serde(default = "default_true")]
    pub create_sample_keypair: bool,
}

impl Default for OpcuaConfig {
    fn default() -> Self {
        Self {
            pki_dir: default_pki_dir(),
            create_sample_keypair: true,
        }
    }
}

fn default_pki_dir() -> PathBuf {
    PathBuf::from("pki")
}

fn default_true() -> bool {
    true
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency per service call in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// Publish changing values for every monitored node
    #[serde(default)]
    pub simulate_values: bool,
    /// Period of simulated value changes
    #[serde(default = "default_simulation_interval_ms")]
    pub simulation_interval_ms: u64,
    /// Simulated latency of session teardown in milliseconds
    #[serde(default)]
    pub close_latency_ms: u64,
}

fn default_simulation_interval_ms() -> u64 {
    1_000
}
