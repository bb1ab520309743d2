//! Router input records

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RouterError, RouterResult};
use crate::ocpp::{DeviceId, OcppMessage};
use crate::pubsub::topic;

/// One queued frame: `{"chargePointId": "<id>", "message": <envelope>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRecord {
    pub charge_point_id: DeviceId,
    pub message: Value,
}

impl QueuedRecord {
    pub fn new(charge_point_id: DeviceId, message: Value) -> Self {
        Self {
            charge_point_id,
            message,
        }
    }

    /// Build a record from a publish on `<id>/in`; the first topic level is the id
    pub fn from_publish(topic_name: &str, payload: &[u8]) -> RouterResult<Self> {
        let charge_point_id = topic::device_from_in_topic(topic_name)
            .ok_or_else(|| RouterError::Topic(topic_name.to_string()))?;
        let message = serde_json::from_slice(payload)?;
        Ok(Self::new(charge_point_id, message))
    }

    /// Decode the carried envelope
    pub fn envelope(&self) -> RouterResult<OcppMessage> {
        Ok(OcppMessage::from_value(&self.message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::Action;
    use serde_json::json;

    #[test]
    fn test_record_from_publish() {
        let record =
            QueuedRecord::from_publish("CP1/in", br#"[2, "42", "Heartbeat", {}]"#).unwrap();
        assert_eq!(record.charge_point_id.as_str(), "CP1");

        match record.envelope().unwrap() {
            OcppMessage::Call(call) => assert_eq!(call.known_action(), Some(Action::Heartbeat)),
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_record_wire_shape() {
        let record: QueuedRecord = serde_json::from_value(json!({
            "chargePointId": "CP2",
            "message": [2, "1", "Heartbeat", {}]
        }))
        .unwrap();
        assert_eq!(record.charge_point_id.as_str(), "CP2");
        assert_eq!(
            serde_json::to_value(&record).unwrap()["chargePointId"],
            "CP2"
        );
    }

    #[test]
    fn test_record_rejections() {
        assert!(matches!(
            QueuedRecord::from_publish("CP1/out", b"[]"),
            Err(RouterError::Topic(_))
        ));
        assert!(matches!(
            QueuedRecord::from_publish("CP1/in", b"not json"),
            Err(RouterError::Record(_))
        ));

        // Valid JSON but not an envelope: fails only when decoded.
        let record = QueuedRecord::from_publish("CP1/in", br#"{"hello": 1}"#).unwrap();
        assert!(matches!(record.envelope(), Err(RouterError::Decode(_))));
    }
}
