use std::collections::HashSet;

use herald_core::Message;
use herald_mqtt::models::{decode_envelope, encode_payload, group_topic, uid_topic, will_topic};

#[test]
fn json_envelope_round_trips_through_the_wire_format() {
    let message = Message::new("demo/echo", Some(serde_json::json!({"text": "hi"})))
        .with_header("herald.sender.uid", "peer-a");

    let payload = encode_payload(&message, &HashSet::new());
    let envelope = decode_envelope(&payload).unwrap();

    assert_eq!(envelope.uid, message.uid);
    assert_eq!(envelope.subject, "demo/echo");
    assert_eq!(envelope.headers.get("herald.sender.uid").map(String::as_str), Some("peer-a"));
}

#[test]
fn topic_layout_is_scoped_by_app_id() {
    assert_eq!(uid_topic("cohorte/herald", "app-1", "peer-a"), "cohorte/herald/app-1/uid/peer-a");
    assert_eq!(group_topic("cohorte/herald", "app-1", "workers"), "cohorte/herald/app-1/group/workers");
    assert_ne!(
        will_topic("cohorte/herald", "app-1"),
        will_topic("cohorte/herald", "app-2")
    );
}
