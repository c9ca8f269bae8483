//! iot-session command line entry point
//!
//! Connects to the configured broker, subscribes to topics and prints the
//! normalized event stream as JSON lines, or publishes a single message.

use clap::{Parser, Subcommand};
use iot_session::codec::{compress_to_base64, is_compressed_topic};
use iot_session::config::{CredentialSource, SessionConfig};
use iot_session::observability::{init_default_logging, init_logging, LogFormat};
use iot_session::transport::MqttTransportFactory;
use iot_session::{
    ConnectRequest, Event, EventSubscription, SessionManager, StaticControlPlane,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{signal, time::Duration};
use tracing::{error, info, warn, Level};

/// How long `publish` waits for the broker to accept the connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Session manager for a managed IoT pub/sub broker
#[derive(Parser)]
#[command(name = "iot-session")]
#[command(about = "Long-lived pub/sub sessions against a managed IoT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOT_SESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe and print events until Ctrl-C
    Run {
        /// Extra topics on top of the configured ones
        #[arg(short, long = "topic")]
        topics: Vec<String>,
    },
    /// Publish one message and disconnect
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        /// Gzip and base64-encode the message
        #[arg(long)]
        compress: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Pretty, false),
        _ => init_logging(Level::TRACE, LogFormat::Pretty, true),
    }

    info!("Starting iot-session v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { topics } => run_session(config, topics).await,
        Commands::Publish {
            topic,
            message,
            compress,
        } => publish_message(config, &topic, &message, compress).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(SessionConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["iot-session.toml", "config/iot-session.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(SessionConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create iot-session.toml".into())
        }
    }
}

/// Wire the MQTT transport and a static control plane into a manager
fn build_manager(config: &SessionConfig) -> Result<SessionManager, Box<dyn std::error::Error>> {
    let options = config.session_options()?;
    let control_plane = StaticControlPlane::new(config.broker.endpoint.clone());
    Ok(SessionManager::with_control_plane(
        Arc::new(MqttTransportFactory),
        Arc::new(control_plane),
        options,
    ))
}

fn connect_request(config: &SessionConfig) -> Result<ConnectRequest, Box<dyn std::error::Error>> {
    if let Some(policy) = &config.credentials.policy_name {
        return Err(format!(
            "policy_name {policy:?} needs a control plane that can attach policies; remove it for the CLI"
        )
        .into());
    }

    let credential = match config.credentials.source {
        CredentialSource::Static => config.static_credential()?,
        other => {
            return Err(format!(
                "credential source {other:?} needs a host application; the CLI supports static only"
            )
            .into())
        }
    };

    let mut request = ConnectRequest::new(credential);
    if let Some(endpoint) = &config.broker.endpoint {
        request = request.with_endpoint(endpoint.clone());
    }
    Ok(request)
}

async fn run_session(
    config: SessionConfig,
    extra_topics: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = build_manager(&config)?;
    let mut events = manager.events();

    manager.connect(connect_request(&config)?).await?;

    for topic in config.session.topics.iter().chain(extra_topics.iter()) {
        // Handles are not awaited; queued topics replay on Connect
        let _ = manager.subscribe(topic).await;
    }

    info!("Session running, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down gracefully...");
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if event == Event::Close {
                        warn!("Transport closed, giving up");
                        break;
                    }
                }
                None => break,
            }
        }
    }

    manager.disconnect().await?;
    Ok(())
}

async fn publish_message(
    config: SessionConfig,
    topic: &str,
    message: &str,
    compress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = if compress {
        if !is_compressed_topic(topic) {
            warn!(topic, "Compressed payload on a topic without the /gz suffix");
        }
        compress_to_base64(message)?
    } else {
        message.to_string()
    };

    let manager = build_manager(&config)?;
    let mut events = manager.events();
    manager.connect(connect_request(&config)?).await?;

    let connected = tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connect(&mut events)).await;
    let result: Result<(), Box<dyn std::error::Error>> = match connected {
        Ok(Ok(())) => manager
            .send(topic, payload.into_bytes())
            .await
            .map_err(Into::into),
        Ok(Err(detail)) => Err(detail.into()),
        Err(_) => Err(format!("broker did not accept the connection within {CONNECT_TIMEOUT:?}").into()),
    };

    if result.is_ok() {
        info!(topic, "Message published");
    }
    manager.disconnect().await?;
    result
}

/// Errors are not fatal here; the transport keeps retrying until it closes
async fn wait_for_connect(events: &mut EventSubscription) -> Result<(), String> {
    while let Some(event) = events.recv().await {
        match event {
            Event::Connect => return Ok(()),
            Event::Error { detail } => {
                warn!(error = %detail, "Connection attempt failed, waiting for retry");
            }
            Event::Close => return Err("transport closed before connecting".to_string()),
            _ => {}
        }
    }
    Err("event stream ended".to_string())
}

fn handle_config_command(
    config: SessionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
