//! Topic layout, access descriptor and envelope codec for the MQTT transport (§4.5, §6).

use std::collections::HashSet;

use herald_core::{AccessDescriptor, Envelope, Message};
use serde_json::Value;

/// Default MQTT topic prefix, scoping every topic below a single Herald
/// deployment (multiple app ids can share a broker).
pub const DEFAULT_TOPIC_PREFIX: &str = "cohorte/herald";

pub const UID_TOPIC: &str = "uid";
pub const GROUP_TOPIC: &str = "group";
pub const RIP_TOPIC: &str = "rip";

/// Access id this transport advertises in peer dumps.
pub const ACCESS_ID: &str = "mqtt";

pub fn uid_topic(prefix: &str, app_id: &str, peer_uid: &str) -> String {
    format!("{prefix}/{app_id}/{UID_TOPIC}/{peer_uid}")
}

pub fn group_topic(prefix: &str, app_id: &str, group: &str) -> String {
    format!("{prefix}/{app_id}/{GROUP_TOPIC}/{group}")
}

pub fn will_topic(prefix: &str, app_id: &str) -> String {
    format!("{prefix}/{app_id}/{RIP_TOPIC}")
}

/// MQTT has nothing to say about a peer beyond "it's reachable through this
/// broker"; the descriptor carries no data, mirroring the source's `Access`
/// bean (hashes/compares as a single anonymous value).
#[derive(Debug)]
pub struct MqttAccess;

impl AccessDescriptor for MqttAccess {
    fn dump(&self) -> Value {
        Value::Bool(true)
    }
}

/// Serializes `message` for the wire: JSON envelope, unless its subject is
/// in `raw_subjects`, in which case the content is sent as plain UTF-8 text
/// (§6). Raw subjects are an encode-only escape hatch for interop with
/// non-Herald consumers on the broker; Herald itself never expects to
/// receive one back as a routed message.
pub fn encode_payload(message: &Message, raw_subjects: &HashSet<String>) -> Vec<u8> {
    if raw_subjects.contains(&message.subject) {
        message
            .content
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .as_bytes()
            .to_vec()
    } else {
        let envelope = Envelope::from(message);
        serde_json::to_vec(&envelope).expect("envelope always serializes")
    }
}

pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_the_declared_layout() {
        assert_eq!(uid_topic("cohorte/herald", "demo", "peer-a"), "cohorte/herald/demo/uid/peer-a");
        assert_eq!(group_topic("cohorte/herald", "demo", "all"), "cohorte/herald/demo/group/all");
        assert_eq!(will_topic("cohorte/herald", "demo"), "cohorte/herald/demo/rip");
    }

    #[test]
    fn raw_subject_bypasses_json() {
        let mut raw = HashSet::new();
        raw.insert("demo/raw".to_string());
        let message = Message::new("demo/raw", Some(Value::String("plain text".into())));
        let payload = encode_payload(&message, &raw);
        assert_eq!(payload, b"plain text");
    }

    #[test]
    fn ordinary_subject_encodes_as_json_envelope() {
        let message = Message::new("demo/echo", Some(Value::String("hi".into())));
        let payload = encode_payload(&message, &HashSet::new());
        let envelope = decode_envelope(&payload).unwrap();
        assert_eq!(envelope.uid, message.uid);
        assert_eq!(envelope.subject, "demo/echo");
    }
}
