//! OCPP protocol layer
//!
//! - `types`: payload types for the actions the router handles
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `device`: charge point identity

pub mod device;
pub mod messages;
pub mod types;

pub use device::{DeviceId, InvalidDeviceId};
pub use messages::*;
pub use types::*;
