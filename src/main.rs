//! `tb-device` - runs a device client with a periodic uptime sample

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tb_device_client::observability::{init_default_logging, init_logging, LogFormat};
use tb_device_client::{ClientError, DeviceClient, DeviceConfig, FileStore, MqttTransport};
use tokio::signal;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Level};

/// Device client for ThingsBoard-style MQTT platforms
#[derive(Parser)]
#[command(name = "tb-device")]
#[command(about = "Provision, claim and run an MQTT device client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TB_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (overrides LOG_LEVEL)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and publish telemetry until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Print the configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["device.toml", "config/device.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    info!("Starting tb-device v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_device(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DeviceConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DeviceConfig::load_from_file(path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create device.toml".into())
}

async fn run_device(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(FileStore::new(config.storage.path.clone()));
    let telemetry_interval = std::time::Duration::from_secs(config.telemetry.interval_secs);

    let mut client = DeviceClient::init(config, MqttTransport::new(), store)?;
    client.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let started = Instant::now();
    let mut ticker = interval(telemetry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Device client running");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = ticker.tick() => {
                publish_uptime(&client, started).await;
            }
        }
    }

    client.destroy().await;
    Ok(())
}

async fn publish_uptime(client: &DeviceClient<MqttTransport>, started: Instant) {
    if !client.is_connected().await {
        debug!("Not connected, skipping telemetry sample");
        return;
    }

    let sample = json!({
        "ts": chrono::Utc::now().timestamp_millis(),
        "values": { "uptime_secs": started.elapsed().as_secs() },
    });

    match client.send_telemetry(&sample).await {
        Ok(()) => debug!("Telemetry sample published"),
        Err(ClientError::NotReady) => debug!("Session not ready, sample dropped"),
        Err(e) => warn!("Telemetry sample dropped: {}", e),
    }
}

fn handle_config_command(config: &DeviceConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration is valid");
    Ok(())
}
