//! Gateway sessions driven over loopback TCP with a real WebSocket client

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ocpp_bridge::{DeviceId, GatewayConfig, GatewayServer, MemoryBroker, MemoryRegistry};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_gateway(broker: &MemoryBroker, registered: &[&str]) -> SocketAddr {
    let registry = MemoryRegistry::with_devices(
        registered.iter().map(|id| DeviceId::new(*id).unwrap()),
    );
    let gateway = GatewayServer::new(
        GatewayConfig::default(),
        Arc::new(registry),
        Arc::new(broker.clone()),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(gateway.serve(listener));
    addr
}

async fn connect(
    addr: SocketAddr,
    path: &str,
    protocols: Option<&'static str>,
) -> Result<Client, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{}{}", addr, path).into_client_request()?;
    if let Some(protocols) = protocols {
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocols));
    }
    let (ws, _) = connect_async(request).await?;
    Ok(ws)
}

async fn next_message(ws: &mut Client) -> Option<Message> {
    tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for a frame")
        .and_then(Result::ok)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn unregistered_device_is_closed_with_policy_violation() {
    let broker = MemoryBroker::new();
    let addr = start_gateway(&broker, &["CP1"]).await;

    let mut ws = connect(addr, "/CP9", Some("ocpp2.0.1")).await.unwrap();

    match next_message(&mut ws).await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert_eq!(frame.reason, "Charge Point CP9 not registered");
        }
        other => panic!("expected policy close, got {:?}", other),
    }
    assert_eq!(broker.total_connects(), 0);
}

#[tokio::test]
async fn reserved_characters_in_path_are_rejected() {
    let broker = MemoryBroker::new();
    let addr = start_gateway(&broker, &["CP1"]).await;

    let mut ws = connect(addr, "/site/CP1", Some("ocpp2.0.1")).await.unwrap();

    match next_message(&mut ws).await {
        Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected policy close, got {:?}", other),
    }
    assert_eq!(broker.total_connects(), 0);
}

#[tokio::test]
async fn missing_subprotocol_is_closed_before_relay() {
    let broker = MemoryBroker::new();
    let addr = start_gateway(&broker, &["CP1"]).await;

    let mut ws = connect(addr, "/CP1", None).await.unwrap();

    assert!(matches!(
        next_message(&mut ws).await,
        Some(Message::Close(_)) | None
    ));
    assert_eq!(broker.total_connects(), 0);
}

#[tokio::test]
async fn unsupported_subprotocol_is_closed_before_relay() {
    let broker = MemoryBroker::new();
    let addr = start_gateway(&broker, &["CP1"]).await;

    // The client may already reject the handshake because no protocol was echoed.
    if let Ok(mut ws) = connect(addr, "/CP1", Some("ocpp1.5")).await {
        assert!(matches!(
            next_message(&mut ws).await,
            Some(Message::Close(_)) | None
        ));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.total_connects(), 0);
}

#[tokio::test]
async fn frames_are_relayed_in_order_both_ways() {
    let broker = MemoryBroker::new();
    let addr = start_gateway(&broker, &["CP1"]).await;

    let mut ws = connect(addr, "/CP1", Some("ocpp1.6, ocpp2.0.1"))
        .await
        .unwrap();
    wait_for(|| broker.subscriber_count("CP1/out") == 1).await;
    assert_eq!(broker.connect_count("CP1"), 1);

    // device -> broker
    let sent: Vec<String> = (0..5)
        .map(|i| format!(r#"[2,"{}","Heartbeat",{{}}]"#, i))
        .collect();
    for frame in &sent {
        ws.send(Message::text(frame.clone())).await.unwrap();
    }
    wait_for(|| broker.published("CP1/in").len() == sent.len()).await;
    let published: Vec<String> = broker
        .published("CP1/in")
        .into_iter()
        .map(|payload| String::from_utf8(payload).unwrap())
        .collect();
    assert_eq!(published, sent);

    // broker -> device
    let responses: Vec<String> = (0..3)
        .map(|i| format!(r#"[3,"{}",{{}}]"#, i))
        .collect();
    for response in &responses {
        broker.publish("CP1/out", response.as_str());
    }
    for expected in &responses {
        match next_message(&mut ws).await {
            Some(Message::Text(text)) => assert_eq!(&text, expected),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    // Closing the socket releases the subscription.
    ws.close(None).await.unwrap();
    while next_message(&mut ws).await.is_some() {}
    wait_for(|| broker.subscriber_count("CP1/out") == 0).await;
}

#[tokio::test]
async fn sessions_are_isolated_per_device() {
    let broker = MemoryBroker::new();
    let addr = start_gateway(&broker, &["CP1", "CP2"]).await;

    let mut cp1 = connect(addr, "/CP1", Some("ocpp2.0.1")).await.unwrap();
    let mut cp2 = connect(addr, "/CP2", Some("ocpp2.0.1")).await.unwrap();
    wait_for(|| {
        broker.subscriber_count("CP1/out") == 1 && broker.subscriber_count("CP2/out") == 1
    })
    .await;

    broker.publish("CP2/out", r#"[3,"b",{}]"#);
    broker.publish("CP1/out", r#"[3,"a",{}]"#);

    assert_eq!(
        next_message(&mut cp1).await,
        Some(Message::text(r#"[3,"a",{}]"#))
    );
    assert_eq!(
        next_message(&mut cp2).await,
        Some(Message::text(r#"[3,"b",{}]"#))
    );

    // One device leaving does not end the other session.
    drop(cp1);
    wait_for(|| broker.subscriber_count("CP1/out") == 0).await;
    assert_eq!(broker.subscriber_count("CP2/out"), 1);

    cp2.send(Message::text("still here")).await.unwrap();
    wait_for(|| broker.published("CP2/in").len() == 1).await;
}
