//! OCPP Router Node - answers charge point calls arriving over MQTT
//!
//! Subscribes to `+/in`, dispatches BootNotification, Heartbeat and
//! StatusNotification, writes reported state to the device shadow and
//! publishes responses on `<charge-point-id>/out`.
//!
//! # Usage
//!
//! ```bash
//! # Single worker
//! IOT_ENDPOINT=xxxx-ats.iot.eu-west-1.amazonaws.com ocpp-router-node
//!
//! # Several workers sharing the load, keeping the registry in sync
//! ocpp-router-node --iot-endpoint broker.local --client-id router-1 \
//!     --shared-group routers --registry-path /var/lib/ocpp/registry.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocpp_bridge::{
    run_worker, Connector, FileRegistry, MessageRouter, MqttConfig, MqttConnector, RegistryWriter,
    RouterConfig, TopicShadowStore, UnsupportedActionPolicy, WorkerConfig,
};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// OCPP message router
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// MQTT client id of this worker
    #[arg(long, env = "ROUTER_CLIENT_ID", default_value = "ocpp-router")]
    client_id: String,

    /// Shared subscription group (several workers split the load)
    #[arg(long, env = "ROUTER_SHARED_GROUP")]
    shared_group: Option<String>,

    /// Heartbeat interval handed out in BootNotification responses (seconds)
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "10")]
    heartbeat_interval: i32,

    /// Answer to unsupported actions: call-error or call-result
    #[arg(long, env = "UNSUPPORTED_ACTION_POLICY", default_value = "call-error")]
    unsupported_action: UnsupportedActionPolicy,

    /// Prefix of the shadow update topics
    #[arg(long, env = "SHADOW_TOPIC_PREFIX", default_value = "$aws/things")]
    shadow_topic_prefix: String,

    /// Deliveries handled concurrently
    #[arg(long, env = "ROUTER_MAX_IN_FLIGHT", default_value = "16")]
    max_in_flight: usize,

    /// Registry file kept in sync with device lifecycle events
    #[arg(long, env = "REGISTRY_PATH")]
    registry_path: Option<PathBuf>,

    /// Lifecycle topic announcing new devices
    #[arg(long, env = "LIFECYCLE_CREATED_TOPIC", default_value = "$aws/events/thing/+/created")]
    created_topic: String,

    /// Lifecycle topic announcing deleted devices
    #[arg(long, env = "LIFECYCLE_DELETED_TOPIC", default_value = "$aws/events/thing/+/deleted")]
    deleted_topic: String,

    #[command(flatten)]
    mqtt: MqttArgs,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(clap::Args, Debug)]
struct MqttArgs {
    /// MQTT broker endpoint
    #[arg(long, env = "IOT_ENDPOINT")]
    iot_endpoint: String,

    /// MQTT broker port
    #[arg(long, env = "IOT_PORT", default_value = "8883")]
    iot_port: u16,

    /// Root CA certificate
    #[arg(long, env = "IOT_ROOT_CA", default_value = "/etc/iot-certificates/AmazonRootCA1.pem")]
    root_ca: PathBuf,

    /// Client certificate
    #[arg(long, env = "IOT_CERTIFICATE", default_value = "/etc/iot-certificates/iot.pem")]
    certificate: PathBuf,

    /// Client private key
    #[arg(long, env = "IOT_PRIVATE_KEY", default_value = "/etc/iot-certificates/iot.key")]
    private_key: PathBuf,

    /// MQTT keep alive in seconds
    #[arg(long, env = "IOT_KEEP_ALIVE_SECS", default_value = "30")]
    keep_alive_secs: u64,
}

impl MqttArgs {
    fn config(&self) -> MqttConfig {
        MqttConfig::new(&self.iot_endpoint)
            .with_port(self.iot_port)
            .with_certificates(&self.root_ca, &self.certificate, &self.private_key)
            .with_keep_alive(Duration::from_secs(self.keep_alive_secs))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    // Build configuration
    let router_config = RouterConfig::default()
        .with_heartbeat_interval(args.heartbeat_interval)
        .with_unsupported_action(args.unsupported_action)
        .with_shadow_topic_prefix(&args.shadow_topic_prefix);
    router_config.validate()?;

    let mut worker_config = WorkerConfig::default()
        .with_client_id(&args.client_id)
        .with_max_in_flight(args.max_in_flight);
    if let Some(group) = &args.shared_group {
        worker_config = worker_config.with_shared_group(group);
    }

    let registry = args.registry_path.as_ref().map(|path| {
        info!("Keeping registry {} in sync with lifecycle events", path.display());
        Arc::new(FileRegistry::new(path)) as Arc<dyn RegistryWriter>
    });
    if registry.is_some() {
        worker_config = worker_config.with_lifecycle_topics(&args.created_topic, &args.deleted_topic);
    }
    worker_config.validate()?;

    let mqtt = args.mqtt.config();
    mqtt.validate()?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               OCPP Router - Message Dispatcher               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Client:    {:<49} ║", truncate(&worker_config.client_id, 49));
    println!("║  Broker:    {:<49} ║", truncate(&format!("{}:{}", mqtt.host, mqtt.port), 49));
    println!("║  Heartbeat: {:<49} ║", format!("{}s", router_config.heartbeat_interval));
    println!("║  Unknown:   {:<49} ║", format!("{:?}", router_config.unsupported_action));
    println!("║  In flight: {:<49} ║", worker_config.max_in_flight);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Unhandled deliveries survive a restart and are redelivered.
    let connector = MqttConnector::from_config(&mqtt)?.with_persistent_session();
    let connection = connector.connect(&worker_config.client_id).await?;

    let shadow = TopicShadowStore::new(
        connection.publisher.clone(),
        router_config.shadow_topic_prefix.clone(),
    );
    let router = Arc::new(MessageRouter::new(
        connection.publisher.clone(),
        Arc::new(shadow),
        router_config,
    ));

    info!("Starting OCPP router...");
    run_worker(connection, router, registry, worker_config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
