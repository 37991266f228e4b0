//! MQTT-SN gateway - main entry point

use clap::{Parser, Subcommand};
use mqttsn_gateway::config::GatewayConfig;
use mqttsn_gateway::observability::{init_default_logging, metrics};
use mqttsn_gateway::Gateway;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// MQTT-SN to MQTT gateway
#[derive(Parser)]
#[command(name = "mqttsn-gateway")]
#[command(about = "Forwards MQTT broker publishes to MQTT-SN clients")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTTSN_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (overrides LOG_LEVEL)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run,
    /// Validate configuration
    Config {
        /// Print the validated configuration as TOML
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => {}
        1 => std::env::set_var("LOG_LEVEL", "DEBUG"),
        _ => std::env::set_var("LOG_LEVEL", "TRACE"),
    }
    init_default_logging();

    info!("Starting MQTT-SN gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_gateway(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Gateway shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(GatewayConfig::load_from_file(path)?);
    }

    // Try default locations
    for path_str in ["gateway.toml", "config/gateway.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(GatewayConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create gateway.toml".into())
}

async fn run_gateway(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Gateway {} starting with {} clients",
        config.gateway.gateway_id,
        config.clients.len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = Gateway::new(config);
    let mut gateway_task = tokio::spawn(gateway.run(shutdown_rx));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let early_exit = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            None
        }
        result = &mut gateway_task => Some(result),
    };

    let result = match early_exit {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(true);
            gateway_task.await
        }
    };

    match serde_json::to_string(&metrics().get_metrics()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Final gateway metrics"),
        Err(e) => error!("Failed to serialise metrics: {}", e),
    }

    result??;
    Ok(())
}

fn handle_config_command(
    config: &GatewayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration is valid");
    if show {
        println!("{}", config.to_toml_string()?);
    }
    Ok(())
}
