//! # OCPP Bridge
//!
//! Bridges charge points speaking OCPP-J over WebSocket to an MQTT broker, and
//! answers the protocol messages that cross that bridge.
//!
//! Two components share this crate and only meet on the broker:
//!
//! - the **gateway** accepts one WebSocket per charge point, checks the
//!   subprotocol and the registry, then relays frames to and from the
//!   device's topics;
//! - the **router** consumes what devices publish, dispatches by action,
//!   updates the device shadow and publishes the correlated response.
//!
//! ## Architecture
//!
//! ```text
//! Charge Point
//!       │ WebSocket (ocpp1.6 / ocpp2.0 / ocpp2.0.1)
//!       ▼
//! ┌─────────────────────────────────┐
//! │    gateway                      │
//! │  negotiate → registry → session │
//! └──────┬───────────────▲──────────┘
//!        │ <id>/in       │ <id>/out
//!        ▼               │
//! ┌─────────────────────────────────┐
//! │    MQTT broker (mutual TLS)     │
//! └──────┬───────────────▲──────────┘
//!        ▼               │
//! ┌─────────────────────────────────┐
//! │    router                       │
//! │  decode → dispatch → respond    │──► shadow
//! └─────────────────────────────────┘
//! ```
//!
//! ## Topics
//!
//! | Topic | Publisher | Subscriber |
//! |-------|-----------|------------|
//! | `<id>/in` | gateway session | router worker |
//! | `<id>/out` | router | gateway session |
//! | `<prefix>/<id>/shadow/update` | router | shadow service |
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_bridge::{FileRegistry, GatewayConfig, GatewayServer, MqttConfig, MqttConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = MqttConnector::from_config(&MqttConfig::new("broker.example.com"))?;
//!     let gateway = GatewayServer::new(
//!         GatewayConfig::default(),
//!         Arc::new(FileRegistry::new("registry.json")),
//!         Arc::new(connector),
//!     );
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod gateway;
pub mod ocpp;
pub mod pubsub;
pub mod registry;
pub mod router;
pub mod shadow;

pub use config::{
    ConfigError, GatewayConfig, MqttConfig, RouterConfig, UnsupportedActionPolicy, WorkerConfig,
};
pub use gateway::{GatewayError, GatewayServer, Session, SessionEnd};
pub use pubsub::{
    Connector, MemoryBroker, MqttConnector, PubSubConnection, PubSubError, PubSubMessage,
    Publisher, Subscriber,
};
pub use registry::{FileRegistry, MemoryRegistry, Registry, RegistryError, RegistryWriter};
pub use router::{run_worker, DispatchOutcome, MessageRouter, QueuedRecord, RouterError};
pub use shadow::{MemoryShadowStore, ShadowError, ShadowStore, TopicShadowStore};

// Re-export key protocol types
pub use ocpp::{Action, Call, CallError, CallResult, DeviceId, OcppError, OcppMessage};
