use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context as _;
use clap::Parser;
use log::{info, warn};

mod config;
mod error;
mod manager;
mod messages;
mod mqtt;
mod poll;
mod registry;
mod scanner;
mod tracker;

/// Publishes presence and battery telemetry of Bluetooth LE devices to MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()))
        .init();

    let config = config::AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let scan = config.scan();
    let registry = registry::DeviceRegistry::new(config.device_configs(), scan.timeouts());
    if registry.is_empty() {
        warn!("No devices configured, only availability will be published");
    }
    info!("Tracking {} devices", registry.len());

    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt);

    let scanner = scanner::BtleScanner::first_adapter()
        .await
        .context("opening bluetooth adapter")?;

    let cycle = poll::PollCycle::new(
        scanner,
        registry.trackers(Instant::now()),
        messages::MessageBuilder::new(config.mqtt.topic_path()),
        scan.probe_options(),
    );

    let core = manager::Manager::new(cycle, mqtt_client, eventloop, scan.interval());
    core.run_loop().await?;

    Ok(())
}
