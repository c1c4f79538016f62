//! Command-line interface for the MQTT IoT agent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iotagent_core::config::env_vars;
use iotagent_core::{
    AgentConfig, DeviceEvent, EventBus, FilteredReceiver, LifecycleEvent, PlatformEvent,
};
use iotagent_mqtt::{derive_route, IotAgent, MqttTransport};
use tokio::sync::watch;
use tracing::{error, info};

/// MQTT IoT agent - route device telemetry and commands to the platform.
#[derive(Parser, Debug)]
#[command(name = "iotagent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Attach to an MQTT broker and run the agent until Ctrl-C.
    ///
    /// The platform bus is in-process: devices are only routed if they are
    /// listed in the `--devices` file, and forwarded updates are logged.
    Run {
        /// Broker host, overrides MQTT_HOST.
        #[arg(long)]
        mqtt_host: Option<String>,
        /// Broker port, overrides MQTT_PORT.
        #[arg(long)]
        mqtt_port: Option<u16>,
        /// JSON array of lifecycle events
        /// (`{"tenant": .., "kind": "device.create", "event": {"data": {..}}}`)
        /// applied to the bus before startup.
        #[arg(long)]
        devices: Option<PathBuf>,
    },
    /// Print the topics derived for a device event.
    Topics {
        /// JSON file holding a device event (`{"data": {...}}`).
        #[arg(required = true)]
        path: PathBuf,
        /// Tenant owning the device.
        #[arg(short, long)]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AgentConfig::from_env();

    init_logging(args.verbose, config.log_json);

    match args.command {
        Command::Run {
            mqtt_host,
            mqtt_port,
            devices,
        } => {
            let mut config = config;
            if let Some(host) = mqtt_host {
                config = config.with_host(host);
            }
            if let Some(port) = mqtt_port {
                config = config.with_port(port);
            }
            run_agent(config, devices.as_deref()).await
        }
        Command::Topics { path, tenant } => print_topics(&path, &tenant),
    }
}

fn init_logging(verbose: bool, json_logging: bool) {
    let default_directive = if verbose {
        "iotagent=debug"
    } else {
        "iotagent=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        // One JSON object per line for container log collectors
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

/// Start the agent on an MQTT broker and block until interrupted.
async fn run_agent(config: AgentConfig, devices: Option<&Path>) -> Result<()> {
    let (transport, driver) = MqttTransport::new(&config).with_context(|| {
        format!(
            "invalid MQTT configuration (see {} and {})",
            env_vars::MQTT_HOST,
            env_vars::MQTT_PORT
        )
    })?;
    info!(
        "Starting IoT agent MQTT {}, broker {}",
        iotagent_mqtt::VERSION,
        driver.broker_addr()
    );

    let bus = EventBus::with_name("platform");
    if let Some(path) = devices {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let events = parse_seed(&raw)
            .with_context(|| format!("{} is not a list of lifecycle events", path.display()))?;
        let active = seed_bus(&bus, events);
        info!("Loaded {} active devices from {}", active, path.display());
    }
    let updates = tokio::spawn(log_attrs_updates(bus.attrs_updates()));
    let agent = Arc::new(IotAgent::new(Arc::new(bus), Arc::new(transport)));

    if let Err(e) = agent.init().await {
        error!("IoT agent MQTT failed to start: {}", e);
        return Err(anyhow::anyhow!("Failed to initialize the agent: {}", e));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let connection = driver.spawn(agent.clone(), shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = connection.await {
        error!("MQTT connection task ended abnormally: {}", e);
    }
    agent.shutdown().await;
    updates.abort();
    Ok(())
}

fn parse_seed(raw: &str) -> serde_json::Result<Vec<LifecycleEvent>> {
    serde_json::from_str(raw)
}

/// Apply seed events in order. The startup replay then routes every device
/// left active. Returns the number of active devices.
fn seed_bus(bus: &EventBus, events: Vec<LifecycleEvent>) -> usize {
    for event in events {
        bus.publish_lifecycle(event.tenant, event.kind, event.event);
    }
    bus.active_device_count()
}

/// The in-process bus has no upstream platform, so forwarded updates are
/// logged instead.
async fn log_attrs_updates(mut updates: FilteredReceiver<fn(&PlatformEvent) -> bool>) {
    while let Some(event) = updates.recv().await {
        if let PlatformEvent::AttrsUpdated(update) = event {
            info!(
                tenant = %update.tenant,
                device = %update.device_id,
                timestamp = ?update.metadata.timestamp,
                "Attribute update: {}",
                serde_json::Value::Object(update.data)
            );
        }
    }
}

/// Derive and print the topics of the device described in `path`.
fn print_topics(path: &Path, tenant: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let event: DeviceEvent = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a device event", path.display()))?;

    let route = derive_route(tenant, &event.data);
    let addressing = if route.is_broadcast() {
        "broadcast"
    } else {
        "unicast"
    };
    println!("device:  {}:{}", tenant, event.device_id());
    println!("mode:    {}", addressing);
    println!("attrs:   {}", route.attrs_topic);
    println!("config:  {}", route.config_topic);
    Ok(())
}
