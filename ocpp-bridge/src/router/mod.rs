//! Message router
//!
//! Consumes the frames charge points publish on `<id>/in`, answers the Calls
//! it understands, records reported state in the device shadow and publishes
//! the answer on `<id>/out`.
//!
//! ```text
//! <id>/in ──► QueuedRecord ──► decode ──► dispatch ──► <id>/out
//!                                            │
//!                                            └──► shadow (BootNotification)
//! ```

pub mod dispatch;
pub mod record;
pub mod worker;

use thiserror::Error;

use crate::ocpp::OcppError;
use crate::pubsub::PubSubError;
use crate::registry::RegistryError;

pub use dispatch::{Dispatch, DispatchOutcome, MessageRouter};
pub use record::QueuedRecord;
pub use worker::run_worker;

/// Errors while handling one record
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("failed to decode OCPP envelope: {0}")]
    Decode(#[from] OcppError),

    #[error("malformed record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("topic {0} does not name a charge point inbox")]
    Topic(String),

    #[error("failed to publish response: {0}")]
    Publish(#[from] PubSubError),

    #[error("registry update failed: {0}")]
    Registry(#[from] RegistryError),
}

impl RouterError {
    /// The record itself is bad; handling it again cannot succeed
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            RouterError::Decode(_) | RouterError::Record(_) | RouterError::Topic(_)
        )
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_bad_records_are_malformed() {
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(RouterError::Record(json).is_malformed());
        assert!(RouterError::Topic("CP1/out".into()).is_malformed());

        assert!(!RouterError::Publish(PubSubError::Closed).is_malformed());
        let io = RegistryError::Io {
            path: "registry.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!RouterError::from(io).is_malformed());
    }
}
