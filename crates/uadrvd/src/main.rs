//! uadrvd - OPC UA driver daemon
//!
//! Connects one driver to an OPC UA server, listens to the configured
//! channels and polls them periodically, logging every value.
//!
//! Usage:
//!   uadrvd [OPTIONS] [config.toml]
//!
//! Options:
//!   --poll-interval <ms>  Override the poll period from the config file
//!
//! If no config file is provided, a simulated server with demo channels is used.
//! Real servers need a build with the `opcua` feature and a config with
//! `[transport] type = "opcua"`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uadrv_core::{
    ChannelConfig, ChannelEvent, ChannelListener, ChannelRecord, Driver, ListenerConfig,
    ValueType,
};
use uadrv_opcua::config::MockConfig;
use uadrv_opcua::{TransportConfig, UaDriver, UaDriverOptions};

/// Parsed command-line arguments
struct Args {
    /// Daemon config file (TOML)
    config_path: Option<String>,
    poll_interval_ms: Option<u64>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args {
        config_path: None,
        poll_interval_ms: None,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--poll-interval" | "-p" => {
                match args.get(i + 1).map(|v| v.parse::<u64>()) {
                    Some(Ok(ms)) => result.poll_interval_ms = Some(ms),
                    Some(Err(_)) => tracing::error!("Invalid value for --poll-interval: {}", args[i + 1]),
                    None => tracing::error!("Missing argument for --poll-interval"),
                }
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                result.config_path = Some(arg.to_string());
                i += 1;
            }
            _ => {
                tracing::warn!("Unknown argument: {}", args[i]);
                i += 1;
            }
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"uadrvd - OPC UA driver daemon

Usage: uadrvd [OPTIONS] [config.toml]

Options:
  -p, --poll-interval <ms>  Poll period for configured channels (0 disables polling)
  -h, --help                Print this help message

Examples:
  # Run against the simulated server
  uadrvd

  # Run with config file
  uadrvd plant.toml
"#
    );
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Deserialize)]
struct DaemonConfig {
    #[serde(default)]
    driver: UaDriverOptions,
    #[serde(default)]
    transport: TransportConfig,
    /// Poll period; 0 disables polling
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default)]
    channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelEntry {
    name: String,
    value_type: ValueType,
    #[serde(default)]
    config: ChannelConfig,
    /// Register a listener for value changes
    #[serde(default = "default_true")]
    listen: bool,
    /// Include the channel in periodic reads
    #[serde(default)]
    poll: bool,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn load_config_file(path: &str) -> anyhow::Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path))?;
    let config: DaemonConfig =
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path))?;
    config
        .driver
        .validate()
        .with_context(|| format!("Invalid [driver] section in {}", path))?;
    Ok(config)
}

fn demo_channel(name: &str, value_type: ValueType, node: &str, poll: bool) -> ChannelEntry {
    ChannelEntry {
        name: name.to_string(),
        value_type,
        config: ChannelConfig::from([("node.id".to_string(), node.to_string())]),
        listen: true,
        poll,
    }
}

fn create_demo_config() -> DaemonConfig {
    DaemonConfig {
        driver: UaDriverOptions {
            endpoint_url: "opc.tcp://simulated:4840".to_string(),
            ..Default::default()
        },
        transport: TransportConfig::Mock(MockConfig {
            simulate_values: true,
            ..Default::default()
        }),
        poll_interval_ms: default_poll_interval_ms(),
        channels: vec![
            demo_channel("temperature", ValueType::Double, "ns=2;s=Demo.Temperature", true),
            demo_channel("pressure", ValueType::Float, "ns=2;s=Demo.Pressure", false),
            demo_channel("counter", ValueType::Long, "ns=2;s=Demo.Counter", true),
            demo_channel("running", ValueType::Boolean, "ns=2;s=Demo.Running", false),
            demo_channel("line", ValueType::String, "ns=2;s=Demo.Name", true),
        ],
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Logs every notification it receives
struct LoggingListener;

impl ChannelListener for LoggingListener {
    fn on_channel_event(&self, event: ChannelEvent) {
        let record = &event.record;
        if record.is_success() {
            tracing::info!(channel = %record.channel_name, value = ?record.value, "Value changed");
        } else {
            tracing::warn!(channel = %record.channel_name, status = ?record.status.message, "Channel failed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "uadrvd=info,uadrv_opcua=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting uadrvd (OPC UA driver daemon)");

    let args = parse_args();
    let mut config = if let Some(ref path) = args.config_path {
        tracing::info!("Loading config from: {}", path);
        load_config_file(path)?
    } else {
        tracing::info!("No config file provided, using simulated server");
        create_demo_config()
    };
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }

    let driver = UaDriver::with_transport(config.driver.clone(), &config.transport)
        .context("Failed to create driver")?;

    let listener: Arc<dyn ChannelListener> = Arc::new(LoggingListener);
    let listens: Vec<_> = config
        .channels
        .iter()
        .filter(|c| c.listen)
        .map(|c| {
            (
                listener.clone(),
                ListenerConfig::new(c.name.clone(), c.value_type, c.config.clone()),
            )
        })
        .collect();
    if !listens.is_empty() {
        tracing::info!("Registering {} channel listeners", listens.len());
        driver
            .register_channel_listeners(listens)
            .context("Failed to register channel listeners")?;
    }

    let polled: Vec<ChannelRecord> = config
        .channels
        .iter()
        .filter(|c| c.poll)
        .map(|c| ChannelRecord::read(c.name.clone(), c.value_type, c.config.clone()))
        .collect();
    let poller = if polled.is_empty() || config.poll_interval_ms == 0 {
        None
    } else {
        let mut prepared = driver
            .prepare_read(polled)
            .context("Failed to prepare polled channels")?;
        let period = Duration::from_millis(config.poll_interval_ms);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match prepared.execute().await {
                    Ok(()) => {
                        for record in prepared.records() {
                            tracing::info!(
                                channel = %record.channel_name,
                                value = ?record.value,
                                ok = record.is_success(),
                                "Polled"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Poll failed"),
                }
            }
        }))
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    if let Some(poller) = poller {
        poller.abort();
    }
    driver.unregister_channel_listeners(&[listener])?;
    driver.disconnect().await?;

    Ok(())
}
