//! Charge point identity
//!
//! The same string names the WebSocket path, the pub/sub topic prefix, the
//! pub/sub client id and the registry key, so it has to be usable as a single
//! MQTT topic level.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffix of the device -> backend topic
pub const IN_SUFFIX: &str = "in";

/// Suffix of the backend -> device topic
pub const OUT_SUFFIX: &str = "out";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidDeviceId {
    #[error("charge point id is empty")]
    Empty,

    #[error("charge point id {0:?} contains a reserved topic character")]
    ReservedCharacter(String),
}

/// Unique identity of one charge point
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidDeviceId> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidDeviceId::Empty);
        }
        if id.contains(['/', '+', '#']) {
            return Err(InvalidDeviceId::ReservedCharacter(id));
        }
        Ok(Self(id))
    }

    /// Extract the identity from a WebSocket request path (`/CP1` -> `CP1`)
    pub fn from_path(path: &str) -> Result<Self, InvalidDeviceId> {
        Self::new(path.trim_matches('/'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic carrying device-originated frames
    pub fn in_topic(&self) -> String {
        format!("{}/{}", self.0, IN_SUFFIX)
    }

    /// Topic carrying frames for the device
    pub fn out_topic(&self) -> String {
        format!("{}/{}", self.0, OUT_SUFFIX)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = InvalidDeviceId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        assert_eq!(DeviceId::from_path("/CP1").unwrap().as_str(), "CP1");
        assert_eq!(DeviceId::from_path("/CP1/").unwrap().as_str(), "CP1");
        assert_eq!(DeviceId::from_path("/"), Err(InvalidDeviceId::Empty));
        assert!(matches!(
            DeviceId::from_path("/site/CP1"),
            Err(InvalidDeviceId::ReservedCharacter(_))
        ));
    }

    #[test]
    fn test_topics() {
        let id: DeviceId = "CP1".parse().unwrap();
        assert_eq!(id.in_topic(), "CP1/in");
        assert_eq!(id.out_topic(), "CP1/out");
    }

    #[test]
    fn test_wildcards_rejected() {
        assert!(DeviceId::new("CP+").is_err());
        assert!(DeviceId::new("#").is_err());
    }

    #[test]
    fn test_serde_validates() {
        let id: DeviceId = serde_json::from_str(r#""CP7""#).unwrap();
        assert_eq!(id.as_str(), "CP7");
        assert!(serde_json::from_str::<DeviceId>(r#""a/b""#).is_err());
    }
}
