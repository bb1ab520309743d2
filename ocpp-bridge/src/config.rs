//! Configuration for the gateway and the router
//!
//! Values are assembled once at process start (the node binaries map flags and
//! environment variables onto these structs) and never change afterwards.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Subprotocols accepted when none are configured
pub const DEFAULT_PROTOCOLS: [&str; 3] = ["ocpp1.6", "ocpp2.0", "ocpp2.0.1"];

/// Heartbeat interval handed out in BootNotification responses (seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL: i32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one OCPP subprotocol must be configured")]
    NoProtocols,

    #[error("heartbeat interval must be positive, got {0}")]
    InvalidHeartbeatInterval(i32),

    #[error("MQTT keep alive must be at least one second")]
    KeepAliveTooShort,

    #[error("MQTT host is empty")]
    EmptyHost,

    #[error("router must accept at least one message in flight")]
    NoConcurrency,

    #[error("unknown unsupported-action policy {0:?} (expected \"call-error\" or \"call-result\")")]
    UnknownPolicy(String),
}

/// Connection gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to
    pub bind: SocketAddr,

    /// Accepted subprotocols, in server preference order
    pub protocols: Vec<String>,

    /// Maximum size of a reassembled WebSocket message
    pub max_message_size: usize,

    /// Maximum size of a single WebSocket frame
    pub max_frame_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            protocols: DEFAULT_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl GatewayConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Default::default()
        }
    }

    /// Replace the accepted subprotocols
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Set WebSocket size limits
    pub fn with_limits(mut self, max_message_size: usize, max_frame_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocols.is_empty() {
            return Err(ConfigError::NoProtocols);
        }
        Ok(())
    }
}

/// Parse a comma separated protocol list, dropping blanks
pub fn parse_protocol_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// MQTT broker connection configuration
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,

    /// Root CA the broker certificate must chain to
    pub root_ca: PathBuf,

    /// Client certificate presented by this process
    pub certificate: PathBuf,

    /// Private key of the client certificate
    pub private_key: PathBuf,

    pub keep_alive: Duration,

    /// Capacity of the client request queue
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            root_ca: PathBuf::from("/etc/iot-certificates/AmazonRootCA1.pem"),
            certificate: PathBuf::from("/etc/iot-certificates/iot.pem"),
            private_key: PathBuf::from("/etc/iot-certificates/iot.key"),
            keep_alive: Duration::from_secs(30),
            channel_capacity: 100,
        }
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the CA, certificate and key paths
    pub fn with_certificates(
        mut self,
        root_ca: impl AsRef<Path>,
        certificate: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
    ) -> Self {
        self.root_ca = root_ca.as_ref().to_path_buf();
        self.certificate = certificate.as_ref().to_path_buf();
        self.private_key = private_key.as_ref().to_path_buf();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::KeepAliveTooShort);
        }
        Ok(())
    }
}

/// How the router answers a CALL whose action it does not handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsupportedActionPolicy {
    /// `[4, id, "NotImplemented", ...]`
    #[default]
    CallError,

    /// `[3, id, {"error": "..."}]`, kept for devices relying on it
    CallResult,
}

impl std::str::FromStr for UnsupportedActionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "call-error" | "callerror" => Ok(Self::CallError),
            "call-result" | "callresult" => Ok(Self::CallResult),
            _ => Err(ConfigError::UnknownPolicy(s.to_string())),
        }
    }
}

/// Message router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Interval returned in BootNotification responses (seconds)
    pub heartbeat_interval: i32,

    pub unsupported_action: UnsupportedActionPolicy,

    /// Shadow documents live under `<prefix>/<id>/shadow/update`
    pub shadow_topic_prefix: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            unsupported_action: UnsupportedActionPolicy::default(),
            shadow_topic_prefix: "$aws/things".to_string(),
        }
    }
}

impl RouterConfig {
    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    pub fn with_unsupported_action(mut self, policy: UnsupportedActionPolicy) -> Self {
        self.unsupported_action = policy;
        self
    }

    pub fn with_shadow_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shadow_topic_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval <= 0 {
            return Err(ConfigError::InvalidHeartbeatInterval(self.heartbeat_interval));
        }
        Ok(())
    }
}

/// Router worker configuration (what it subscribes to, how much it runs at once)
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Client id of the worker's broker connection
    pub client_id: String,

    /// Filter for device-originated frames
    pub inbound_filter: String,

    /// Shared subscription group, if several workers split the load
    pub shared_group: Option<String>,

    /// Lifecycle topics feeding the registry (created, deleted)
    pub created_filter: Option<String>,
    pub deleted_filter: Option<String>,

    /// Records processed concurrently
    pub max_in_flight: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            client_id: "ocpp-router".to_string(),
            inbound_filter: "+/in".to_string(),
            shared_group: None,
            created_filter: None,
            deleted_filter: None,
            max_in_flight: 16,
        }
    }
}

impl WorkerConfig {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_shared_group(mut self, group: impl Into<String>) -> Self {
        self.shared_group = Some(group.into());
        self
    }

    /// Keep the registry in sync with device lifecycle events
    pub fn with_lifecycle_topics(
        mut self,
        created: impl Into<String>,
        deleted: impl Into<String>,
    ) -> Self {
        self.created_filter = Some(created.into());
        self.deleted_filter = Some(deleted.into());
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::NoConcurrency);
        }
        Ok(())
    }
}
