//! MQTT transport over mutually authenticated TLS
//!
//! Every connection presents the process-wide client certificate and verifies
//! the broker against the configured root CA. rustls only negotiates TLS 1.2
//! and 1.3, which sets the protocol floor.
//!
//! A persistent session (used by the router) keeps the broker-side session
//! across reconnects and acknowledges deliveries only when asked to, so a
//! delivery that was never handled is redelivered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    TlsConfiguration, Transport,
};
use tracing::{debug, info};

use super::{Connector, PubSubConnection, PubSubError, PubSubMessage, PubSubResult, Publisher, Subscriber};
use crate::config::MqttConfig;

/// Opens one TLS MQTT connection per client id
#[derive(Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    keep_alive: Duration,
    channel_capacity: usize,
    persistent_session: bool,
    tls: TlsConfiguration,
}

impl MqttConnector {
    /// Load the CA and client key pair named in the config
    pub fn from_config(config: &MqttConfig) -> PubSubResult<Self> {
        let ca = read_pem(&config.root_ca)?;
        let cert = read_pem(&config.certificate)?;
        let key = read_pem(&config.private_key)?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            keep_alive: config.keep_alive,
            channel_capacity: config.channel_capacity,
            persistent_session: false,
            tls: TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            },
        })
    }

    /// Keep the broker session between connections and acknowledge deliveries manually
    pub fn with_persistent_session(mut self) -> Self {
        self.persistent_session = true;
        self
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(!self.persistent_session);
        options.set_manual_acks(self.persistent_session);
        options.set_transport(Transport::tls_with_config(self.tls.clone()));
        options
    }
}

impl std::fmt::Debug for MqttConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("keep_alive", &self.keep_alive)
            .field("persistent_session", &self.persistent_session)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, client_id: &str) -> PubSubResult<PubSubConnection> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options(client_id), self.channel_capacity);

        // The event loop connects lazily; drive it until the broker answers.
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(PubSubError::Refused(format!("{:?}", ack.code)));
                    }
                    break;
                }
                other => debug!("MQTT event before CONNACK: {:?}", other),
            }
        }

        info!("Connected to MQTT broker {}:{} as {}", self.host, self.port, client_id);

        Ok(PubSubConnection::new(
            Arc::new(MqttPublisher {
                client: client.clone(),
            }),
            Box::new(MqttSubscriber {
                client,
                eventloop,
                manual_acks: self.persistent_session,
            }),
        ))
    }
}

struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> PubSubResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn ack(&self, message: &PubSubMessage) -> PubSubResult<()> {
        let Some(pkid) = message.delivery_id else {
            return Ok(());
        };
        // Only the packet id and QoS go into the PUBACK.
        let mut publish = Publish::new(message.topic.as_str(), QoS::AtLeastOnce, Vec::<u8>::new());
        publish.pkid = pkid;
        self.client.ack(&publish).await?;
        Ok(())
    }

    // The request channel is only drained while the event loop is polled, which
    // may have stopped already; never wait on it here.
    async fn disconnect(&self) -> PubSubResult<()> {
        self.client.try_disconnect()?;
        Ok(())
    }
}

/// Owns the event loop; polling it also flushes queued publishes
struct MqttSubscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    manual_acks: bool,
}

#[async_trait]
impl Subscriber for MqttSubscriber {
    async fn subscribe(&mut self, topic_filter: &str) -> PubSubResult<()> {
        self.client
            .subscribe(topic_filter, QoS::AtLeastOnce)
            .await?;
        Ok(())
    }

    async fn next_message(&mut self) -> PubSubResult<Option<PubSubMessage>> {
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    let delivery_id = (self.manual_acks && publish.qos != QoS::AtMostOnce)
                        .then_some(publish.pkid);
                    return Ok(Some(PubSubMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        delivery_id,
                    }));
                }
                Event::Incoming(Packet::SubAck(_)) => debug!("Subscription acknowledged"),
                Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect) => {
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}

fn read_pem(path: &std::path::Path) -> PubSubResult<Vec<u8>> {
    std::fs::read(path).map_err(|source| PubSubError::Tls {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_certificate_is_reported() {
        let config = MqttConfig::new("broker.local").with_certificates(
            "/nonexistent/ca.pem",
            "/nonexistent/cert.pem",
            "/nonexistent/key.pem",
        );

        match MqttConnector::from_config(&config) {
            Err(PubSubError::Tls { path, .. }) => assert_eq!(path, "/nonexistent/ca.pem"),
            other => panic!("expected TLS error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_loads_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for name in ["ca.pem", "iot.pem", "iot.key"] {
            let path = dir.path().join(name);
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "-----BEGIN {}-----", name).unwrap();
            paths.push(path);
        }

        let config = MqttConfig::new("broker.local")
            .with_port(8883)
            .with_certificates(&paths[0], &paths[1], &paths[2]);
        let connector = MqttConnector::from_config(&config).unwrap();

        assert_eq!(connector.port, 8883);
        let options = connector.options("CP1");
        assert_eq!(options.client_id(), "CP1");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert!(options.clean_session());
        assert!(!options.manual_acks());

        let options = connector.with_persistent_session().options("router");
        assert!(!options.clean_session());
        assert!(options.manual_acks());
    }

    #[tokio::test]
    async fn test_disconnect_does_not_wait_for_full_channel() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("CP1", "localhost", 1883), 1);
        client
            .try_publish("CP1/in", QoS::AtLeastOnce, false, b"queued".to_vec())
            .unwrap();
        let publisher = MqttPublisher { client };

        let result = tokio::time::timeout(Duration::from_secs(2), publisher.disconnect()).await;
        assert!(result.is_ok(), "disconnect blocked on a full request channel");
    }

    #[tokio::test]
    async fn test_ack_without_delivery_id_is_a_no_op() {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("CP1", "localhost", 1883), 1);
        drop(eventloop);
        let publisher = MqttPublisher { client };

        // The request channel is closed, so anything actually sent would fail.
        tokio_test::assert_ok!(publisher.ack(&PubSubMessage::new("CP1/in", "x")).await);
    }
}
