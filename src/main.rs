//! Pulsar bridge command line host
//!
//! Runs the configured trigger handlers, publishes single messages, or
//! validates a configuration file.

use clap::{Parser, Subcommand};
use pulsar_bridge::config::BridgeConfig;
use pulsar_bridge::observability::init_default_logging;
use pulsar_bridge::trigger::{HandlerError, InitializeReport, LoopExit};
use pulsar_bridge::{
    ConnectionFactory, PublishInput, Publisher, PulsarConnection, Trigger, TriggerHandler,
    TriggerOutput,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn, Instrument};

/// How long stopped loops get to settle their in-flight message
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Bridge between a workflow host and Apache Pulsar
#[derive(Parser)]
#[command(name = "pulsar-bridge")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PULSAR_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe every configured handler and log the messages received
    Run,
    /// Publish one message using the [publish] settings
    Publish {
        /// Text payload
        #[arg(long)]
        message: String,
        /// Message key
        #[arg(long)]
        key: Option<String>,
        /// Message property, repeatable
        #[arg(long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },
    /// Validate the configuration
    Config {
        /// Print the configuration with credentials masked
        #[arg(long)]
        show: bool,
    },
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_trigger(config).await,
        Commands::Publish {
            message,
            key,
            properties,
        } => publish_once(config, message, key, properties).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => ["bridge.toml", "config/bridge.toml"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or("no configuration file found; pass --config or create bridge.toml")?,
    };
    info!("Loading configuration from: {}", path.display());
    Ok(BridgeConfig::load_from_file(&path)?)
}

/// Logs each delivered message; stands in for a host workflow
struct LoggingHandler {
    label: String,
}

#[async_trait::async_trait]
impl TriggerHandler for LoggingHandler {
    async fn handle(&self, output: TriggerOutput) -> Result<(), HandlerError> {
        info!(
            handler = %self.label,
            key = ?output.key,
            properties = ?output.properties,
            structured = output.message_obj.is_some(),
            "Message received: {}",
            output.message
        );
        Ok(())
    }
}

async fn connect(config: &BridgeConfig) -> Result<PulsarConnection, Box<dyn std::error::Error>> {
    let connection = ConnectionFactory::pulsar()
        .new_connection(config.connection.clone())
        .await?;
    connection.start().await?;
    Ok(connection)
}

async fn run_trigger(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.handlers.is_empty() {
        return Err("no [[handlers]] configured".into());
    }

    let connection = connect(&config).await?;
    let mut trigger = Trigger::new(&connection);

    let handlers = config
        .handlers
        .iter()
        .map(|settings| {
            let handler: Arc<dyn TriggerHandler> = Arc::new(LoggingHandler {
                label: format!("{}/{}", settings.topic, settings.subscription),
            });
            (settings.clone(), handler)
        })
        .collect();

    let InitializeReport {
        subscribed,
        failures,
    } = trigger.initialize(handlers).await;
    for failure in &failures {
        warn!("Handler not started: {}", failure.sanitized());
    }
    if subscribed == 0 {
        connection.release_connection().await;
        return Err("no handler could be subscribed".into());
    }

    trigger.start();
    info!(handlers = subscribed, "Bridge is running");

    wait_for_shutdown_signal().await?;

    async {
        info!("Shutdown initiated");
        trigger.stop();
        // Closing the client wakes loops still blocked in receive
        connection.release_connection().await;

        match tokio::time::timeout(SHUTDOWN_GRACE, trigger.join()).await {
            Ok(exits) => {
                for (label, exit) in exits {
                    match exit {
                        LoopExit::Stopped | LoopExit::ReceiveFailed(_) => {
                            info!(handler = %label, "Handler stopped")
                        }
                        LoopExit::Aborted(reason) => {
                            warn!(handler = %label, "Handler aborted: {}", reason)
                        }
                    }
                }
            }
            Err(_) => warn!("Handlers did not stop within {:?}", SHUTDOWN_GRACE),
        }
    }
    .instrument(pulsar_bridge::lifecycle_span!(event = "shutdown"))
    .await;

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
    Ok(())
}

async fn publish_once(
    config: BridgeConfig,
    message: String,
    key: Option<String>,
    properties: Vec<(String, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config
        .publish
        .clone()
        .ok_or("no [publish] section configured")?;

    let connection = connect(&config).await?;
    let mut input = PublishInput::text(message);
    input.key = key;
    for (name, value) in properties {
        input = input.with_property(name, value);
    }

    let result = match Publisher::new(&connection, settings).await {
        Ok(publisher) => publisher.publish(input).await,
        Err(e) => Err(e),
    };
    connection.release_connection().await;

    let output = result?;
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }
    info!(
        connection = %config.connection.name,
        auth = %config.connection.auth,
        handlers = config.handlers.len(),
        "Configuration is valid"
    );
    Ok(())
}
