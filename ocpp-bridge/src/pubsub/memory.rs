//! In-process broker
//!
//! Routes publishes to every matching subscription, keeps a log of what was
//! published and counts connections per client id. Every delivery carries a
//! delivery id and stays pending until it is acknowledged. Subscriptions disappear
//! when their [`Subscriber`] is dropped or its connection disconnects, and a
//! disconnected subscriber sees the end of its message stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::topic;
use super::{Connector, PubSubConnection, PubSubError, PubSubMessage, PubSubResult, Publisher, Subscriber};

struct Subscription {
    subscriber_id: u64,
    filter: String,
}

#[derive(Default)]
struct BrokerState {
    /// Delivery channel of every open connection
    inboxes: HashMap<u64, mpsc::UnboundedSender<PubSubMessage>>,
    subscriptions: Vec<Subscription>,
    published: Vec<PubSubMessage>,
    connects: HashMap<String, usize>,
    next_delivery_id: u16,
    /// Deliveries waiting for an ack, by connection and delivery id
    pending: HashMap<(u64, u16), PubSubMessage>,
    acked: Vec<PubSubMessage>,
}

impl BrokerState {
    fn route(&mut self, message: PubSubMessage) {
        for sub in &self.subscriptions {
            if !topic::matches(&sub.filter, &message.topic) {
                continue;
            }
            let Some(inbox) = self.inboxes.get(&sub.subscriber_id) else {
                continue;
            };
            self.next_delivery_id = self.next_delivery_id.wrapping_add(1);
            let delivery = PubSubMessage {
                delivery_id: Some(self.next_delivery_id),
                ..message.clone()
            };
            if inbox.send(delivery.clone()).is_ok() {
                self.pending
                    .insert((sub.subscriber_id, self.next_delivery_id), delivery);
            }
        }
        self.published.push(message);
    }

    fn ack(&mut self, subscriber_id: u64, delivery_id: u16) {
        if let Some(message) = self.pending.remove(&(subscriber_id, delivery_id)) {
            self.acked.push(message);
        }
    }

    fn release(&mut self, subscriber_id: u64) {
        self.inboxes.remove(&subscriber_id);
        self.subscriptions
            .retain(|sub| sub.subscriber_id != subscriber_id);
    }
}

/// Shared in-memory broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection without counting it as a client connect
    pub fn open(&self) -> PubSubConnection {
        let subscriber_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().inboxes.insert(subscriber_id, tx);

        PubSubConnection::new(
            Arc::new(MemoryPublisher {
                broker: self.clone(),
                subscriber_id,
                closed: Mutex::new(false),
            }),
            Box::new(MemorySubscriber {
                broker: self.clone(),
                subscriber_id,
                rx,
            }),
        )
    }

    /// Publish from outside any connection
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.state.lock().route(PubSubMessage::new(topic, payload));
    }

    /// Payloads published on `topic`, in order
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Payloads delivered on `topic` and acknowledged, in ack order
    pub fn acked(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .acked
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Deliveries still waiting for an ack
    pub fn unacked_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of [`Connector::connect`] calls made with this client id
    pub fn connect_count(&self, client_id: &str) -> usize {
        self.state.lock().connects.get(client_id).copied().unwrap_or(0)
    }

    /// Total number of [`Connector::connect`] calls
    pub fn total_connects(&self) -> usize {
        self.state.lock().connects.values().sum()
    }

    /// Live subscriptions whose filter matches `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|sub| topic::matches(&sub.filter, topic))
            .count()
    }

    fn release(&self, subscriber_id: u64) {
        self.state.lock().release(subscriber_id);
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("subscriptions", &state.subscriptions.len())
            .field("published", &state.published.len())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, client_id: &str) -> PubSubResult<PubSubConnection> {
        *self
            .state
            .lock()
            .connects
            .entry(client_id.to_string())
            .or_insert(0) += 1;
        Ok(self.open())
    }
}

struct MemoryPublisher {
    broker: MemoryBroker,
    subscriber_id: u64,
    closed: Mutex<bool>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> PubSubResult<()> {
        if *self.closed.lock() {
            return Err(PubSubError::Closed);
        }
        self.broker.publish(topic, payload);
        Ok(())
    }

    async fn ack(&self, message: &PubSubMessage) -> PubSubResult<()> {
        if *self.closed.lock() {
            return Err(PubSubError::Closed);
        }
        if let Some(delivery_id) = message.delivery_id {
            self.broker.state.lock().ack(self.subscriber_id, delivery_id);
        }
        Ok(())
    }

    async fn disconnect(&self) -> PubSubResult<()> {
        *self.closed.lock() = true;
        self.broker.release(self.subscriber_id);
        Ok(())
    }
}

struct MemorySubscriber {
    broker: MemoryBroker,
    subscriber_id: u64,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&mut self, topic_filter: &str) -> PubSubResult<()> {
        let mut state = self.broker.state.lock();
        if !state.inboxes.contains_key(&self.subscriber_id) {
            return Err(PubSubError::Closed);
        }
        state.subscriptions.push(Subscription {
            subscriber_id: self.subscriber_id,
            filter: topic_filter.to_string(),
        });
        Ok(())
    }

    async fn next_message(&mut self) -> PubSubResult<Option<PubSubMessage>> {
        Ok(self.rx.recv().await)
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.broker.release(self.subscriber_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_by_filter() {
        let broker = MemoryBroker::new();
        let mut conn = broker.open();
        conn.subscriber.subscribe("+/in").await.unwrap();

        broker.publish("CP1/out", "skip");
        broker.publish("CP1/in", "first");
        conn.publisher.publish("CP2/in", b"second".to_vec()).await.unwrap();

        let first = conn.subscriber.next_message().await.unwrap().unwrap();
        assert_eq!(first.topic, "CP1/in");
        assert_eq!(first.payload, b"first");

        let second = conn.subscriber.next_message().await.unwrap().unwrap();
        assert_eq!(second.topic, "CP2/in");

        assert_eq!(broker.published("CP1/out"), vec![b"skip".to_vec()]);
    }

    #[tokio::test]
    async fn test_deliveries_stay_pending_until_acked() {
        let broker = MemoryBroker::new();
        let mut conn = broker.open();
        conn.subscriber.subscribe("+/in").await.unwrap();

        broker.publish("CP1/in", "first");
        broker.publish("CP1/in", "second");
        let first = conn.subscriber.next_message().await.unwrap().unwrap();
        let second = conn.subscriber.next_message().await.unwrap().unwrap();
        assert_ne!(first.delivery_id, second.delivery_id);
        assert_eq!(broker.unacked_count(), 2);

        conn.publisher.ack(&second).await.unwrap();
        assert_eq!(broker.acked("CP1/in"), vec![b"second".to_vec()]);
        assert_eq!(broker.unacked_count(), 1);

        // Messages that were never delivered have nothing to acknowledge.
        conn.publisher.ack(&PubSubMessage::new("CP1/in", "first")).await.unwrap();
        assert_eq!(broker.unacked_count(), 1);
    }

    #[tokio::test]
    async fn test_connects_are_counted() {
        let broker = MemoryBroker::new();
        let _ = broker.open();
        assert_eq!(broker.total_connects(), 0);

        let _conn = broker.connect("CP1").await.unwrap();
        assert_eq!(broker.connect_count("CP1"), 1);
        assert_eq!(broker.connect_count("CP2"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_releases_subscriptions() {
        let broker = MemoryBroker::new();
        let mut conn = broker.open();
        conn.subscriber.subscribe("CP1/out").await.unwrap();
        assert_eq!(broker.subscriber_count("CP1/out"), 1);

        conn.publisher.disconnect().await.unwrap();
        assert_eq!(broker.subscriber_count("CP1/out"), 0);
        assert!(matches!(
            conn.publisher.publish("CP1/in", vec![]).await,
            Err(PubSubError::Closed)
        ));
        assert_eq!(conn.subscriber.next_message().await.unwrap(), None);
        assert!(conn.subscriber.subscribe("CP1/out").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_releases_subscriptions() {
        let broker = MemoryBroker::new();
        let mut conn = broker.open();
        conn.subscriber.subscribe("CP1/out").await.unwrap();

        drop(conn);
        assert_eq!(broker.subscriber_count("CP1/out"), 0);
    }
}
