//! WebSocket subprotocol negotiation
//!
//! The handshake always completes; whether the negotiated protocol is usable
//! is decided afterwards from the captured [`Handshake`], so a rejected client
//! sees a proper close frame instead of an HTTP error.

use tokio_tungstenite::tungstenite::handshake::server::{Callback, ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderMap, HeaderValue};
use tracing::debug;

/// What the client asked for and what the server picked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Request path, e.g. `/CP1`
    pub path: String,
    /// Subprotocols offered by the client, in its order
    pub offered: Vec<String>,
    /// Subprotocol echoed back in the handshake response
    pub selected: Option<String>,
}

/// Why a handshake cannot carry an OCPP session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationFailure {
    #[error("client hasn't requested any subprotocol")]
    NoneOffered,

    #[error("protocols mismatched: expected one of {supported:?}, but client supports {offered:?}")]
    Mismatch {
        offered: Vec<String>,
        supported: Vec<String>,
    },
}

impl Handshake {
    /// The negotiated subprotocol, or why there is none
    pub fn protocol(&self, supported: &[String]) -> Result<&str, NegotiationFailure> {
        if self.offered.is_empty() {
            return Err(NegotiationFailure::NoneOffered);
        }
        match self.selected.as_deref() {
            Some(protocol) if !protocol.is_empty() => Ok(protocol),
            _ => Err(NegotiationFailure::Mismatch {
                offered: self.offered.clone(),
                supported: supported.to_vec(),
            }),
        }
    }
}

/// Subprotocols listed in (possibly repeated) `Sec-WebSocket-Protocol` headers
pub fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pick the protocol both sides support with the best combined rank
/// (client position + server position); ties go to the client's preference.
pub fn select_subprotocol(offered: &[String], supported: &[String]) -> Option<String> {
    offered
        .iter()
        .enumerate()
        .filter_map(|(client_rank, protocol)| {
            supported
                .iter()
                .position(|s| s == protocol)
                .map(|server_rank| (client_rank + server_rank, client_rank, protocol))
        })
        .min_by_key(|(combined, client_rank, _)| (*combined, *client_rank))
        .map(|(_, _, protocol)| protocol.clone())
}

/// Handshake callback recording the request into a [`Handshake`]
pub struct NegotiationCallback<'a> {
    supported: &'a [String],
    handshake: &'a mut Handshake,
}

impl<'a> NegotiationCallback<'a> {
    pub fn new(supported: &'a [String], handshake: &'a mut Handshake) -> Self {
        Self {
            supported,
            handshake,
        }
    }
}

impl Callback for NegotiationCallback<'_> {
    fn on_request(self, request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
        self.handshake.path = request.uri().path().to_string();
        self.handshake.offered = offered_protocols(request.headers());

        if let Some(protocol) = select_subprotocol(&self.handshake.offered, self.supported) {
            if let Ok(value) = HeaderValue::from_str(&protocol) {
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                self.handshake.selected = Some(protocol);
            }
        }

        debug!(
            "Handshake for {}: offered {:?}, selected {:?}",
            self.handshake.path, self.handshake.offered, self.handshake.selected
        );
        Ok(response)
    }
}
