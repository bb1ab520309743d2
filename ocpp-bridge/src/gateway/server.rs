//! WebSocket listener for charge points
//!
//! Accepts connections and runs every session in its own task. Admission is
//! checked in order (subprotocol, identity, registry) and a connection that
//! fails a check is closed before any broker connection is opened.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::negotiation::{Handshake, NegotiationCallback, NegotiationFailure};
use super::session::{close_quietly, Session};
use super::GatewayError;
use crate::config::GatewayConfig;
use crate::ocpp::DeviceId;
use crate::pubsub::Connector;
use crate::registry::Registry;

/// First pause after a failed accept, doubled on every further failure
const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Pause before the next accept after `failures` consecutive failures
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF
        .saturating_mul(1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX))
        .min(MAX_ACCEPT_BACKOFF)
}

/// Connection gateway: many concurrent sessions over shared collaborators
#[derive(Clone)]
pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    registry: Arc<dyn Registry>,
    connector: Arc<dyn Connector>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn Registry>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            connector,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Bind the configured address and serve forever
    pub async fn run(self) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        self.serve(listener).await
    }

    /// Serve until `shutdown` resolves. Sessions already running are left to end on their own.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.serve(listener) => result,
            _ = shutdown => {
                info!("Gateway shutting down, no longer accepting connections");
                Ok(())
            }
        }
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        info!(
            "OCPP gateway listening on ws://{} (subprotocols: {})",
            listener.local_addr()?,
            self.config.protocols.join(", ")
        );

        let mut failures: u32 = 0;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(e) => {
                    // Out of file descriptors and similar errors persist for a while.
                    failures = failures.saturating_add(1);
                    let pause = accept_backoff(failures);
                    warn!("Failed to accept connection: {} (retrying in {:?})", e, pause);
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, peer).await {
                    debug!("Connection from {} finished with error: {}", peer, e);
                }
            });
        }
    }

    /// Serve one accepted connection from handshake to teardown
    pub async fn handle_connection<S>(&self, stream: S, peer: SocketAddr) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut ws, handshake) = match self.accept(stream).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return Err(e);
            }
        };

        let device_id = match self.admit(&handshake).await {
            Ok(id) => id,
            Err(e) => {
                match &e {
                    GatewayError::Negotiation(NegotiationFailure::NoneOffered) => {
                        info!("Client {} hasn't requested any subprotocol, closing connection", peer)
                    }
                    GatewayError::Negotiation(failure) => error!("Client {}: {}", peer, failure),
                    other => error!("Rejecting {} on {}: {}", peer, handshake.path, other),
                }
                close_quietly(&mut ws, e.close_frame()).await;
                return Err(e);
            }
        };

        info!("Charge point {} connected from {}", device_id, peer);

        let connection = match self.connector.connect(device_id.as_str()).await {
            Ok(connection) => connection,
            Err(e) => {
                let e = GatewayError::from(e);
                error!("Broker connection for {} failed: {}", device_id, e);
                close_quietly(&mut ws, e.close_frame()).await;
                return Err(e);
            }
        };

        Session::new(device_id, ws, connection).run().await.map(|_| ())
    }

    /// Tagged authorization check: `Unregistered` when the registry has no entry
    pub async fn authorize(&self, id: &DeviceId) -> Result<(), GatewayError> {
        if self.registry.exists(id).await? {
            Ok(())
        } else {
            Err(GatewayError::Unregistered(id.clone()))
        }
    }

    async fn accept<S>(&self, stream: S) -> Result<(WebSocketStream<S>, Handshake), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_frame_size),
            ..Default::default()
        };

        let mut handshake = Handshake::default();
        let ws = accept_hdr_async_with_config(
            stream,
            NegotiationCallback::new(&self.config.protocols, &mut handshake),
            Some(ws_config),
        )
        .await?;

        Ok((ws, handshake))
    }

    async fn admit(&self, handshake: &Handshake) -> Result<DeviceId, GatewayError> {
        let protocol = handshake.protocol(&self.config.protocols)?;
        let device_id = DeviceId::from_path(&handshake.path)?;
        self.authorize(&device_id).await?;
        debug!("Admitted {} with subprotocol {}", device_id, protocol);
        Ok(device_id)
    }
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryBroker;
    use crate::registry::{MemoryRegistry, MockRegistry, RegistryError};

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    fn server(registry: Arc<dyn Registry>) -> GatewayServer {
        GatewayServer::new(
            GatewayConfig::default(),
            registry,
            Arc::new(MemoryBroker::new()),
        )
    }

    fn handshake(path: &str, selected: Option<&str>) -> Handshake {
        Handshake {
            path: path.to_string(),
            offered: vec!["ocpp2.0.1".to_string()],
            selected: selected.map(str::to_string),
        }
    }

    #[test]
    fn test_accept_backoff_doubles_up_to_limit() {
        assert_eq!(accept_backoff(1), Duration::from_millis(5));
        assert_eq!(accept_backoff(2), Duration::from_millis(10));
        assert_eq!(accept_backoff(4), Duration::from_millis(40));
        assert_eq!(accept_backoff(9), MAX_ACCEPT_BACKOFF);
        assert_eq!(accept_backoff(40), MAX_ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_authorize_returns_tagged_error() {
        let gateway = server(Arc::new(MemoryRegistry::with_devices([id("CP1")])));

        tokio_test::assert_ok!(gateway.authorize(&id("CP1")).await);
        match gateway.authorize(&id("CP2")).await {
            Err(GatewayError::Unregistered(missing)) => assert_eq!(missing, id("CP2")),
            other => panic!("expected Unregistered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registry_failure_is_not_unregistered() {
        let mut registry = MockRegistry::new();
        registry.expect_exists().returning(|_| {
            Err(RegistryError::Io {
                path: "registry.json".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        });
        let gateway = server(Arc::new(registry));

        assert!(matches!(
            gateway.authorize(&id("CP1")).await,
            Err(GatewayError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn test_admission_order() {
        let gateway = server(Arc::new(MemoryRegistry::with_devices([id("CP1")])));

        // Negotiation is checked before identity.
        assert!(matches!(
            gateway.admit(&handshake("/", None)).await,
            Err(GatewayError::Negotiation(NegotiationFailure::Mismatch { .. }))
        ));
        assert!(matches!(
            gateway.admit(&handshake("/", Some("ocpp2.0.1"))).await,
            Err(GatewayError::InvalidDevice(_))
        ));
        assert!(matches!(
            gateway.admit(&handshake("/CP2", Some("ocpp2.0.1"))).await,
            Err(GatewayError::Unregistered(_))
        ));
        assert_eq!(
            gateway
                .admit(&handshake("/CP1", Some("ocpp2.0.1")))
                .await
                .unwrap(),
            id("CP1")
        );
    }
}
