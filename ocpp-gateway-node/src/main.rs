//! OCPP Gateway Node - WebSocket endpoint for charge points
//!
//! Accepts charge point WebSockets on `ws://<host>:<port>/<charge-point-id>`
//! and relays every frame to the MQTT broker.
//!
//! # Usage
//!
//! ```bash
//! # Everything from the environment
//! IOT_ENDPOINT=xxxx-ats.iot.eu-west-1.amazonaws.com ocpp-gateway-node
//!
//! # Explicit flags
//! ocpp-gateway-node --iot-endpoint broker.local --port 9000 \
//!     --protocols ocpp2.0.1 --registry-path /var/lib/ocpp/registry.json
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocpp_bridge::config::parse_protocol_list;
use ocpp_bridge::{FileRegistry, GatewayConfig, GatewayServer, MqttConfig, MqttConnector};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// OCPP WebSocket to MQTT connection gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "OCPP_GATEWAY_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// WebSocket port
    #[arg(short, long, env = "OCPP_GATEWAY_PORT", default_value = "8080")]
    port: u16,

    /// Accepted subprotocols, comma separated, in preference order
    #[arg(long, env = "OCPP_PROTOCOLS", default_value = "ocpp1.6,ocpp2.0,ocpp2.0.1")]
    protocols: String,

    /// Maximum WebSocket message size in bytes
    #[arg(long, env = "OCPP_MAX_MESSAGE_SIZE", default_value = "65536")]
    max_message_size: usize,

    /// Maximum WebSocket frame size in bytes
    #[arg(long, env = "OCPP_MAX_FRAME_SIZE", default_value = "16384")]
    max_frame_size: usize,

    /// Charge point registry file
    #[arg(long, env = "REGISTRY_PATH", default_value = "registry.json")]
    registry_path: PathBuf,

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
    let config = GatewayConfig::new(SocketAddr::new(args.host, args.port))
        .with_protocols(parse_protocol_list(&args.protocols))
        .with_limits(args.max_message_size, args.max_frame_size);
    config.validate()?;

    let mqtt = args.mqtt.config();
    mqtt.validate()?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP Gateway - Charge Point Endpoint            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:    {:<49} ║", config.bind);
    println!("║  Protocols: {:<49} ║", truncate(&config.protocols.join(","), 49));
    println!("║  Broker:    {:<49} ║", truncate(&format!("{}:{}", mqtt.host, mqtt.port), 49));
    println!("║  Registry:  {:<49} ║", truncate(&args.registry_path.display().to_string(), 49));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let connector = MqttConnector::from_config(&mqtt)?;
    let registry = FileRegistry::new(&args.registry_path);

    let listener = TcpListener::bind(config.bind).await?;
    let gateway = GatewayServer::new(config, Arc::new(registry), Arc::new(connector));

    info!("Starting OCPP gateway...");
    gateway
        .serve_with_shutdown(listener, async {
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
