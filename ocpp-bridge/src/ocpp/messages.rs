//! OCPP JSON-RPC envelope framing
//!
//! Every frame on the wire is a JSON array tagged by its first element:
//! - CALL: [2, uniqueId, action, payload]
//! - CALLRESULT: [3, uniqueId, payload]
//! - CALLERROR: [4, uniqueId, errorCode, errorDescription, errorDetails]
//!
//! The bridge never invents unique ids of its own: responses are always built
//! from the [`Call`] they answer so the id is carried over.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Actions the router knows how to dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    BootNotification,
    Heartbeat,
    StatusNotification,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(&'static str),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// OCPP CALL message (request)
///
/// The action is kept as the raw string from the wire so that unknown actions
/// still decode and can be answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a CALL with the given id
    pub fn new(
        unique_id: impl Into<String>,
        action: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Self, OcppError> {
        Ok(Self {
            unique_id: unique_id.into(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Resolve the action name against the dispatchable set
    pub fn known_action(&self) -> Option<Action> {
        self.action.parse().ok()
    }

    /// Build the CALLRESULT answering this call
    pub fn result(&self, payload: impl Serialize) -> Result<CallResult, OcppError> {
        CallResult::new(self.unique_id.clone(), payload)
    }

    /// Build the CALLERROR answering this call
    pub fn error(&self, error_code: ErrorCode, error_description: impl Into<String>) -> CallError {
        CallError::new(self.unique_id.clone(), error_code, error_description)
    }

    /// Wire representation: [2, uniqueId, action, payload]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::Call as i32,
            &self.unique_id,
            &self.action,
            &self.payload
        ])
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(unique_id: String, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            unique_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Wire representation: [3, uniqueId, payload]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallResult as i32,
            &self.unique_id,
            &self.payload
        ])
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub unique_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        unique_id: String,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            unique_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Wire representation: [4, uniqueId, errorCode, errorDescription, errorDetails]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallError as i32,
            &self.unique_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ])
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(&value)
    }

    /// Interpret an already-decoded JSON value as an envelope
    pub fn from_value(value: &Value) -> Result<Self, OcppError> {
        let array = value
            .as_array()
            .ok_or(OcppError::InvalidFormat("envelope is not an array"))?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat("missing message type"))?;

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat("CALL must have 4 elements"));
                }

                let action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat("action is not a string"))?
                    .to_string();

                Ok(OcppMessage::Call(Call {
                    unique_id: unique_id(&array[1])?,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat("CALLRESULT must have 3 elements"));
                }

                Ok(OcppMessage::CallResult(CallResult {
                    unique_id: unique_id(&array[1])?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat("CALLERROR must have 5 elements"));
                }

                let error_code_str = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat("error code is not a string"))?;

                // Codes outside the known set are folded into GenericError.
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                Ok(OcppMessage::CallError(CallError {
                    unique_id: unique_id(&array[1])?,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the unique id
    pub fn unique_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.unique_id,
            OcppMessage::CallResult(r) => &r.unique_id,
            OcppMessage::CallError(e) => &e.unique_id,
        }
    }

    /// Wire representation as a JSON value
    pub fn to_value(&self) -> Value {
        match self {
            OcppMessage::Call(c) => c.to_value(),
            OcppMessage::CallResult(r) => r.to_value(),
            OcppMessage::CallError(e) => e.to_value(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }
}

fn unique_id(value: &Value) -> Result<String, OcppError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(OcppError::InvalidFormat("unique id is not a string"))
}
