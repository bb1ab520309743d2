//! One charge point session
//!
//! A session binds a WebSocket to a dedicated broker connection and runs two
//! loops until either side ends:
//! - forward: WebSocket frames published to `<id>/in`
//! - relay: messages from `<id>/out` sent as WebSocket frames
//!
//! Both loops live in one `select!`, so the first to finish cancels the other
//! and the broker connection is released together with the socket.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::GatewayError;
use crate::ocpp::DeviceId;
use crate::pubsub::{self, PubSubConnection, Publisher, Subscriber};

/// How long teardown keeps the broker connection polled to flush the disconnect
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The charge point closed the WebSocket or dropped the connection
    DeviceClosed,
    /// The broker closed the pub/sub connection
    BrokerClosed,
}

pub struct Session<S> {
    device_id: DeviceId,
    session_id: Uuid,
    ws: WebSocketStream<S>,
    connection: PubSubConnection,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(device_id: DeviceId, ws: WebSocketStream<S>, connection: PubSubConnection) -> Self {
        Self {
            device_id,
            session_id: Uuid::new_v4(),
            ws,
            connection,
        }
    }

    /// Relay until either side ends, then release both connections
    pub async fn run(self) -> Result<SessionEnd, GatewayError> {
        let span = tracing::info_span!(
            "session",
            device = %self.device_id,
            session_id = %self.session_id
        );
        self.relay_until_closed().instrument(span).await
    }

    async fn relay_until_closed(self) -> Result<SessionEnd, GatewayError> {
        let Session {
            device_id,
            ws,
            connection,
            ..
        } = self;
        let PubSubConnection {
            publisher,
            mut subscriber,
        } = connection;

        let in_topic = device_id.in_topic();
        let out_topic = device_id.out_topic();
        let (mut sink, mut stream) = ws.split();

        info!("Session started");

        let outcome = match subscriber.subscribe(&out_topic).await {
            Ok(()) => {
                tokio::select! {
                    result = forward(&mut stream, publisher.as_ref(), &in_topic) => result,
                    result = relay(&mut sink, subscriber.as_mut(), &out_topic) => result,
                }
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = pubsub::release(publisher.as_ref(), subscriber.as_mut(), RELEASE_TIMEOUT).await {
            debug!("Broker disconnect failed: {}", e);
        }
        drop(subscriber);

        let frame = match &outcome {
            Ok(SessionEnd::DeviceClosed) => None,
            Ok(SessionEnd::BrokerClosed) => Some(CloseFrame {
                code: CloseCode::Error,
                reason: "broker connection closed".into(),
            }),
            Err(e) => e.close_frame(),
        };
        match sink.reunite(stream) {
            Ok(mut ws) => close_quietly(&mut ws, frame).await,
            Err(_) => warn!("WebSocket halves could not be reunited for close"),
        }

        match &outcome {
            Ok(end) => info!("Session ended: {:?}", end),
            Err(e) => warn!("Session ended with error: {}", e),
        }
        outcome
    }
}

/// Publish every data frame of the WebSocket to `topic`, in arrival order
async fn forward<R>(
    stream: &mut R,
    publisher: &dyn Publisher,
    topic: &str,
) -> Result<SessionEnd, GatewayError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let payload = match frame? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Close(frame) => {
                debug!("Charge point sent close: {:?}", frame);
                return Ok(SessionEnd::DeviceClosed);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        debug!("-> {} ({} bytes)", topic, payload.len());
        publisher.publish(topic, payload).await?;
    }
    Ok(SessionEnd::DeviceClosed)
}

/// Send every message received from the broker to the WebSocket
async fn relay<W>(
    sink: &mut W,
    subscriber: &mut dyn Subscriber,
    topic: &str,
) -> Result<SessionEnd, GatewayError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let Some(message) = subscriber.next_message().await? else {
            return Ok(SessionEnd::BrokerClosed);
        };
        debug!("<- {} ({} bytes)", topic, message.payload.len());

        // OCPP-J frames are text; anything that is not UTF-8 goes out as binary.
        let frame = match String::from_utf8(message.payload) {
            Ok(text) => Message::text(text),
            Err(e) => Message::binary(e.into_bytes()),
        };
        sink.send(frame).await?;
    }
}

/// Close the WebSocket, ignoring a peer that is already gone
pub(crate) async fn close_quietly<S>(ws: &mut WebSocketStream<S>, frame: Option<CloseFrame<'static>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match ws.close(frame).await {
        Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
        Err(e) => debug!("Closing WebSocket failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{Connector, MemoryBroker, MockPublisher, PubSubError};
    use futures_util::{sink, stream};
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn frames(messages: Vec<Message>) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_forward_publishes_in_order() {
        let broker = MemoryBroker::new();
        let conn = broker.open();
        let mut frames = frames(vec![
            Message::text("[2,\"1\",\"Heartbeat\",{}]"),
            Message::Ping(vec![1]),
            Message::binary(vec![0xff, 0x00]),
            Message::text("[2,\"2\",\"Heartbeat\",{}]"),
        ]);

        let end = forward(&mut frames, conn.publisher.as_ref(), "CP1/in")
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::DeviceClosed);
        assert_eq!(
            broker.published("CP1/in"),
            vec![
                b"[2,\"1\",\"Heartbeat\",{}]".to_vec(),
                vec![0xff, 0x00],
                b"[2,\"2\",\"Heartbeat\",{}]".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn test_forward_stops_at_close() {
        let broker = MemoryBroker::new();
        let conn = broker.open();
        let mut frames = frames(vec![
            Message::text("first"),
            Message::Close(None),
            Message::text("after close"),
        ]);

        forward(&mut frames, conn.publisher.as_ref(), "CP1/in")
            .await
            .unwrap();
        assert_eq!(broker.published("CP1/in"), vec![b"first".to_vec()]);
    }

    #[tokio::test]
    async fn test_forward_surfaces_publish_failure() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(PubSubError::Closed));
        let publisher: Arc<dyn Publisher> = Arc::new(publisher);

        let mut frames = frames(vec![Message::text("a"), Message::text("b")]);
        let result = forward(&mut frames, publisher.as_ref(), "CP1/in").await;

        assert!(matches!(result, Err(GatewayError::PubSub(PubSubError::Closed))));
    }

    #[tokio::test]
    async fn test_relay_sends_text_and_binary() {
        let broker = MemoryBroker::new();
        let mut conn = broker.open();
        conn.subscriber.subscribe("CP1/out").await.unwrap();

        broker.publish("CP1/out", "[3,\"1\",{}]");
        broker.publish("CP1/out", vec![0xc3, 0x28]);
        conn.publisher.disconnect().await.unwrap();

        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let collected = sent.clone();
        let mut sink = Box::pin(sink::unfold((), move |(), frame: Message| {
            let collected = collected.clone();
            async move {
                collected.lock().push(frame);
                Ok::<_, WsError>(())
            }
        }));

        let end = relay(&mut sink, conn.subscriber.as_mut(), "CP1/out")
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::BrokerClosed);
        assert_eq!(
            *sent.lock(),
            vec![Message::text("[3,\"1\",{}]"), Message::binary(vec![0xc3, 0x28])]
        );
    }

    #[tokio::test]
    async fn test_broker_close_closes_websocket_with_error() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("CP1").await.unwrap();
        let broker_side = connection.publisher.clone();

        let (device_io, gateway_io) = tokio::io::duplex(4096);
        let gateway_ws = WebSocketStream::from_raw_socket(gateway_io, Role::Server, None).await;
        let mut device_ws = WebSocketStream::from_raw_socket(device_io, Role::Client, None).await;

        let session = tokio::spawn(
            Session::new(DeviceId::new("CP1").unwrap(), gateway_ws, connection).run(),
        );
        for _ in 0..100 {
            if broker.subscriber_count("CP1/out") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.subscriber_count("CP1/out"), 1);

        broker_side.disconnect().await.unwrap();

        match tokio::time::timeout(Duration::from_secs(5), device_ws.next()).await {
            Ok(Some(Ok(Message::Close(Some(frame))))) => {
                assert_eq!(frame.code, CloseCode::Error);
                assert_eq!(frame.reason, "broker connection closed");
            }
            other => panic!("expected close 1011, got {:?}", other),
        }
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::BrokerClosed);
    }
}
