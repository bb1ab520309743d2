//! Publish/subscribe transport
//!
//! The gateway and the router only talk to the broker through these traits:
//! - [`Connector`] opens one dedicated connection per client id
//! - [`Publisher`] is the shareable sending half
//! - [`Subscriber`] is the receiving half, owned by a single reader
//!
//! `mqtt` provides the rumqttc implementation used in production, `memory`
//! an in-process broker used by tests and local runs.

pub mod memory;
pub mod mqtt;
pub mod topic;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub use memory::MemoryBroker;
pub use mqtt::MqttConnector;

/// Errors raised by a pub/sub transport
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("failed to load TLS material from {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed")]
    Closed,
}

pub type PubSubResult<T> = Result<T, PubSubError>;

/// One message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker waits for [`Publisher::ack`] before it forgets the message
    pub delivery_id: Option<u16>,
}

impl PubSubMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            delivery_id: None,
        }
    }
}

/// Sending half of a broker connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish with at-least-once delivery
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> PubSubResult<()>;

    /// Acknowledge a handled delivery. Unacknowledged deliveries are redelivered
    /// by the broker.
    async fn ack(&self, message: &PubSubMessage) -> PubSubResult<()>;

    /// Release the connection without waiting on the transport. Later publishes fail.
    async fn disconnect(&self) -> PubSubResult<()>;
}

/// Receiving half of a broker connection
#[async_trait]
pub trait Subscriber: Send {
    async fn subscribe(&mut self, topic_filter: &str) -> PubSubResult<()>;

    /// Next message on any subscribed filter; `None` once the broker closed the connection
    async fn next_message(&mut self) -> PubSubResult<Option<PubSubMessage>>;
}

/// Opens broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, client_id: &str) -> PubSubResult<PubSubConnection>;
}

/// An established broker connection split into its two halves
pub struct PubSubConnection {
    pub publisher: Arc<dyn Publisher>,
    pub subscriber: Box<dyn Subscriber>,
}

impl PubSubConnection {
    pub fn new(publisher: Arc<dyn Publisher>, subscriber: Box<dyn Subscriber>) -> Self {
        Self {
            publisher,
            subscriber,
        }
    }
}

/// Disconnect, then keep polling `subscriber` until the connection reports
/// closed so the disconnect is flushed. Polling stops after `timeout`.
pub async fn release(
    publisher: &dyn Publisher,
    subscriber: &mut dyn Subscriber,
    timeout: Duration,
) -> PubSubResult<()> {
    publisher.disconnect().await?;

    let flushed = tokio::time::timeout(timeout, async {
        while let Ok(Some(message)) = subscriber.next_message().await {
            debug!("Leaving delivery on {} unacknowledged while disconnecting", message.topic);
        }
    })
    .await;
    if flushed.is_err() {
        debug!("Connection still open {:?} after disconnect", timeout);
    }
    Ok(())
}

impl std::fmt::Debug for PubSubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubConnection").finish_non_exhaustive()
    }
}
