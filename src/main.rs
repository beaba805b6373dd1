//! meshbridge - local/cloud MQTT bridge agent
//!
//! Usage:
//!   meshbridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   --local-url <URL>      Local broker URL (default: mqtt://127.0.0.1:1883)
//!   -s, --serial <SERIAL>  Device serial used to tag local messages
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::oneshot;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshbridge::agent::{Agent, ControlBus};
use meshbridge::bridge::Bridge;
use meshbridge::config::Config;
use meshbridge::remote::MqttConnector;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// meshbridge - local/cloud MQTT bridge agent
#[derive(Parser, Debug)]
#[command(name = "meshbridge")]
#[command(version)]
#[command(about = "Bridges device traffic between a local MQTT broker and the cloud")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local broker URL
    #[arg(long)]
    local_url: Option<String>,

    /// Device serial used to tag local messages
    #[arg(short, long)]
    serial: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file if given, otherwise defaults plus MESHBRIDGE__* overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(url) = args.local_url {
        file_config.local.url = url;
    }
    if let Some(serial) = args.serial {
        file_config.local.serial = Some(serial);
    }
    if let Err(e) = file_config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let settings = file_config.bridge_settings()?;
    let rules = file_config.rule_set()?;
    let local_url = settings.local_url.clone();

    info!("Starting meshbridge");
    info!("  Local broker: {}", local_url);
    info!("  Serial: {}", settings.serial);
    info!(
        "  Rules: {} local->cloud, {} cloud->local",
        rules.local_to_cloud.len(),
        rules.cloud_to_local.len()
    );
    info!(
        "  Backoff: {:?} transient, {:?} credential rejected",
        file_config.bridge.backoff.transient, file_config.bridge.backoff.credential_rejected
    );

    let connector = Arc::new(MqttConnector::new(file_config.connector_settings()));
    let bridge = Bridge::new(settings, rules, connector.clone());
    let agent = Arc::new(Agent::new(bridge));

    // Start the bridge from the saved cloud target, if any
    if let Some(cloud) = &file_config.cloud {
        info!("  Cloud: {} (from configuration)", cloud.url);
        if let Err(e) = agent.start_bridge(&cloud.url, &cloud.token).await {
            warn!("Initial bridge connect failed, retrying in background: {}", e);
        }
    } else {
        info!("  Cloud: waiting for a connect request");
    }

    let (bus_shutdown, bus_task) = if file_config.control.enabled {
        info!(
            "  Control bus: enabled (status every {:?})",
            file_config.control.status_interval
        );
        let bus = ControlBus::new(
            agent.clone(),
            connector,
            local_url,
            file_config.control.status_interval,
        );
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(tokio::spawn(bus.run(rx))))
    } else {
        info!("  Control bus: disabled");
        (None, None)
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(tx) = bus_shutdown {
        let _ = tx.send(());
    }
    if let Some(task) = bus_task {
        if let Err(e) = task.await {
            error!("Control bus task failed: {}", e);
        }
    }
    if agent.bridge().is_configured() {
        if let Err(e) = agent.stop_bridge().await {
            warn!("Stopping bridge: {}", e);
        }
    }

    Ok(())
}
