//! mqtt-agent: subscribe to an MQTT topic filter and emit structured events

use clap::{Parser, Subcommand};
use mqtt_agent::agent::{RestartPolicy, WorkerSettings, WorkerSupervisor};
use mqtt_agent::config::AgentConfig;
use mqtt_agent::error::{AgentError, AgentResult};
use mqtt_agent::observability::{health::HealthServer, init_default_logging, metrics::metrics};
use mqtt_agent::sink;
use mqtt_agent::transport::mqtt::{MqttClient, MqttConnector};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// How long a stop may take before the worker task is aborted
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `publish` waits for the broker to acknowledge
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["mqtt-agent.toml", "config/mqtt-agent.toml"];

/// MQTT subscription worker
#[derive(Parser)]
#[command(name = "mqtt-agent")]
#[command(about = "Subscribe to an MQTT topic filter and emit one JSON event per message")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show the parsed configuration
        #[arg(long)]
        show: bool,
    },
    /// Publish one message, e.g. to test a running worker
    Publish {
        /// Payload, sent as-is
        #[arg(short, long)]
        message: String,
        /// Concrete topic; defaults to the configured topic, which must then have no wildcards
        #[arg(short, long)]
        topic: Option<String>,
        /// Ask the broker to retain the message
        #[arg(long)]
        retain: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(e.exit_code());
        }
    };

    let result = match cli.command {
        Commands::Run => run_worker(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Publish {
            message,
            topic,
            retain,
        } => publish_message(config, topic, message, retain).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(e.exit_code());
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> AgentResult<AgentConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(path)?);
        }
    }

    Err(mqtt_agent::config::ConfigError::InvalidConfig(
        "no configuration file found; pass -c/--config or create mqtt-agent.toml".to_string(),
    )
    .into())
}

async fn run_worker(config: AgentConfig) -> AgentResult<()> {
    info!(agent = %config.agent.name, topic = %config.mqtt.topic, "Worker starting");

    let event_sink = sink::from_config(&config.sink)?;
    let connector = MqttConnector::new(&config.agent.name, config.mqtt.clone());
    let mut supervisor = WorkerSupervisor::new(
        WorkerSettings::from_config(&config),
        connector,
        event_sink,
        RestartPolicy::from(&config.worker),
    );
    let control = supervisor.control();

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let health_server = Arc::new(HealthServer::new(
        config.agent.name.clone(),
        health_port,
        control.activity(),
        control.subscribe_state(),
        chrono::Duration::days(i64::from(config.worker.expected_update_period_in_days)),
    ));
    let health_task = tokio::spawn(Arc::clone(&health_server).start());

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;

    supervisor.start();

    let outcome = loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break supervisor.shutdown(SHUTDOWN_TIMEOUT).await;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break supervisor.shutdown(SHUTDOWN_TIMEOUT).await;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, restarting subscription");
                control.restart();
            }
            finished = supervisor.wait() => {
                error!("Worker supervision ended on its own");
                break finished;
            }
        }
    };

    health_task.abort();

    let snapshot = metrics().get_metrics();
    info!(
        events_emitted = snapshot.events.events_emitted,
        sink_failures = snapshot.events.sink_failures,
        restarts = snapshot.lifecycle.scheduled_restarts + snapshot.lifecycle.requested_restarts,
        "Worker finished"
    );

    outcome.map_err(AgentError::from)
}

fn handle_config_command(config: &AgentConfig, show: bool) -> AgentResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| AgentError::internal_error(format!("cannot render config: {e}")))?;
        println!("Current configuration:");
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn publish_message(
    config: AgentConfig,
    topic: Option<String>,
    message: String,
    retain: bool,
) -> AgentResult<()> {
    let topic = topic.unwrap_or_else(|| config.mqtt.topic.clone());
    let topic = topic.as_str();
    mqtt_agent::protocol::validate_topic_name(topic)
        .map_err(mqtt_agent::transport::mqtt::MqttError::from)?;

    let mut client = MqttClient::new(&format!("{}-publish", config.agent.name), config.mqtt);
    client.connect().await?;

    let published = client
        .publish_and_flush(topic, message.into_bytes(), retain, PUBLISH_ACK_TIMEOUT)
        .await;
    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "Disconnect after publish failed");
    }
    published?;

    info!(topic = %topic, retain = retain, "Message published");
    Ok(())
}
