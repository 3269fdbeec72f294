//! edgebridge - MQTT edge bridge
//!
//! Usage:
//!   edgebridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   --check                Validate the configuration and exit
//!   -h, --help             Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use edgebridge::bridge::BridgeManager;
use edgebridge::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
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

/// edgebridge - MQTT edge bridge
#[derive(Parser, Debug)]
#[command(name = "edgebridge")]
#[command(version)]
#[command(about = "Bridges a device's local MQTT bus to a remote broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = "/etc/edgebridge/edgebridge.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    if args.check {
        println!(
            "Configuration OK: {} bridge(s), {} enabled",
            file_config.bridge.len(),
            file_config.enabled_bridges().count()
        );
        return Ok(());
    }

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
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

    info!("Loaded configuration from {:?}", args.config);
    info!("Starting edgebridge");
    info!(
        "  Local broker: {}:{}",
        file_config.local.host, file_config.local.port
    );
    for bridge_cfg in &file_config.bridge {
        let status = if bridge_cfg.enabled {
            "enabled"
        } else {
            "disabled"
        };
        info!(
            "    - {} -> {}:{} ({}) [{}]",
            bridge_cfg.name(),
            bridge_cfg.host,
            bridge_cfg.port(),
            bridge_cfg.protocol,
            status
        );
        info!(
            "      publish: {:?}, subscribe: {:?}",
            bridge_cfg.publish_whitelist, bridge_cfg.subscribe_whitelist
        );
    }

    let manager = match BridgeManager::from_config(&file_config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Error starting bridges: {}", e);
            std::process::exit(1);
        }
    };
    info!("  Bridges: {} running", manager.bridge_count());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    manager.shutdown().await;

    Ok(())
}
