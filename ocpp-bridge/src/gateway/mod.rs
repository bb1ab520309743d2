//! Connection gateway
//!
//! Accepts charge point WebSockets, checks subprotocol and registration, then
//! relays frames between the socket and the device's pub/sub topics.

pub mod negotiation;
pub mod server;
pub mod session;

use std::borrow::Cow;

use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::ocpp::{DeviceId, InvalidDeviceId};
use crate::pubsub::PubSubError;
use crate::registry::RegistryError;

pub use negotiation::{Handshake, NegotiationFailure};
pub use server::GatewayServer;
pub use session::{Session, SessionEnd};

/// Close reasons are limited to 123 bytes by RFC 6455
const MAX_CLOSE_REASON: usize = 123;

/// Errors ending a gateway connection
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("subprotocol negotiation failed: {0}")]
    Negotiation(#[from] NegotiationFailure),

    #[error("invalid charge point id: {0}")]
    InvalidDevice(#[from] InvalidDeviceId),

    #[error("Charge Point {0} not registered")]
    Unregistered(DeviceId),

    #[error("registry lookup failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("pub/sub error: {0}")]
    PubSub(#[from] PubSubError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Close frame sent to the device for this error, if any
    pub fn close_frame(&self) -> Option<CloseFrame<'static>> {
        match self {
            GatewayError::Negotiation(_) => None,
            GatewayError::Unregistered(_) | GatewayError::InvalidDevice(_) => Some(CloseFrame {
                code: CloseCode::Policy,
                reason: close_reason(self.to_string()),
            }),
            _ => Some(CloseFrame {
                code: CloseCode::Error,
                reason: Cow::Borrowed("internal error"),
            }),
        }
    }
}

fn close_reason(mut reason: String) -> Cow<'static, str> {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    Cow::Owned(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        let unregistered = GatewayError::Unregistered(DeviceId::new("CP1").unwrap());
        let frame = unregistered.close_frame().unwrap();
        assert_eq!(frame.code, CloseCode::Policy);
        assert_eq!(frame.reason, "Charge Point CP1 not registered");

        let invalid = GatewayError::InvalidDevice(InvalidDeviceId::Empty);
        assert_eq!(invalid.close_frame().unwrap().code, CloseCode::Policy);

        let transport = GatewayError::PubSub(PubSubError::Closed);
        assert_eq!(transport.close_frame().unwrap().code, CloseCode::Error);

        let negotiation = GatewayError::Negotiation(NegotiationFailure::NoneOffered);
        assert!(negotiation.close_frame().is_none());
    }

    #[test]
    fn test_long_close_reason_is_truncated() {
        let id = DeviceId::new("ä".repeat(100)).unwrap();
        let frame = GatewayError::Unregistered(id).close_frame().unwrap();
        assert!(frame.reason.len() <= MAX_CLOSE_REASON);
        assert!(frame.reason.starts_with("Charge Point ä"));
    }
}
