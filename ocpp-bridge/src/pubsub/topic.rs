//! MQTT topic helpers

use crate::ocpp::{device, DeviceId};

/// Prefix of an MQTT 5 / AWS IoT shared subscription (`$share/<group>/<filter>`)
const SHARED_PREFIX: &str = "$share/";

/// Build a filter, optionally as a shared subscription so several router
/// workers split the load
pub fn shared_filter(group: Option<&str>, filter: &str) -> String {
    match group {
        Some(group) => format!("{}{}/{}", SHARED_PREFIX, group, filter),
        None => filter.to_string(),
    }
}

/// Remove a `$share/<group>/` prefix, if present
pub fn strip_shared(filter: &str) -> &str {
    match filter.strip_prefix(SHARED_PREFIX) {
        Some(rest) => rest.split_once('/').map(|(_, f)| f).unwrap_or(""),
        None => filter,
    }
}

/// Does `topic` match `filter` (`+` one level, `#` the remaining levels)?
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter = strip_shared(filter);
    let mut topic_levels = topic.split('/');

    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    topic_levels.next().is_none()
}

/// Extract the charge point from a `<id>/in` topic
pub fn device_from_in_topic(topic: &str) -> Option<DeviceId> {
    let (id, suffix) = topic.split_once('/')?;
    if suffix != device::IN_SUFFIX {
        return None;
    }
    DeviceId::new(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches() {
        assert!(matches("CP1/out", "CP1/out"));
        assert!(!matches("CP1/out", "CP2/out"));
        assert!(matches("+/in", "CP1/in"));
        assert!(!matches("+/in", "CP1/out"));
        assert!(!matches("+/in", "a/b/in"));
        assert!(matches("$aws/events/thing/+/created", "$aws/events/thing/CP1/created"));
        assert!(matches("CP1/#", "CP1/in"));
        assert!(!matches("CP1/out/x", "CP1/out"));
    }

    #[test]
    fn test_shared_filters() {
        assert_eq!(shared_filter(Some("routers"), "+/in"), "$share/routers/+/in");
        assert_eq!(shared_filter(None, "+/in"), "+/in");
        assert_eq!(strip_shared("$share/routers/+/in"), "+/in");
        assert!(matches("$share/routers/+/in", "CP1/in"));
    }

    #[test]
    fn test_device_from_in_topic() {
        assert_eq!(device_from_in_topic("CP1/in").unwrap().as_str(), "CP1");
        assert!(device_from_in_topic("CP1/out").is_none());
        assert!(device_from_in_topic("CP1").is_none());
        assert!(device_from_in_topic("/in").is_none());
    }
}
