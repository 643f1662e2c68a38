//! Message envelopes exchanged between Herald peers.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the UID of the peer that sent a message.
pub const HEADER_SENDER_UID: &str = "herald.sender.uid";
/// Header carrying the UID of the targeted peer, when addressed point-to-point.
pub const HEADER_TARGET_PEER: &str = "herald.target.peer";
/// Header carrying the name of the targeted group, when addressed by group.
pub const HEADER_TARGET_GROUP: &str = "herald.target.group";
/// Header carrying the UID of the message this one replies to.
pub const HEADER_REPLIES_TO: &str = "herald.replies.to";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// An outbound message. Constructing one does not transmit it; only
/// `fire`/`send`/`post` do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uid: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    pub timestamp: i64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Message {
    /// Creates a new message with a fresh random UID and the current timestamp.
    pub fn new(subject: impl Into<String>, content: Option<Value>) -> Self {
        Message {
            uid: uuid::Uuid::new_v4().to_string(),
            subject: subject.into(),
            content,
            timestamp: now_millis(),
            headers: HashMap::new(),
        }
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(key, value);
        self
    }
}

/// A message as handed to the engine by a transport: the envelope plus the
/// bookkeeping the engine needs to route a reply back through the same
/// transport and connection.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    pub uid: String,
    pub subject: String,
    pub content: Option<Value>,
    pub timestamp: i64,
    pub headers: HashMap<String, String>,
    /// UID of the peer that sent this message.
    pub sender: String,
    /// UID of the message this one answers, if any.
    pub reply_to: Option<String>,
    /// Access id of the transport that delivered this message.
    pub access: String,
    /// Opaque transport-specific data needed to reply on the same transport
    /// (e.g. MQTT's `sender_uid`/`parent_uid`).
    pub extra: HashMap<String, String>,
}

impl MessageReceived {
    /// Splits `subject` on `/`, dropping empty segments (mirrors the
    /// source's handling of leading/trailing/doubled slashes).
    pub fn subject_parts(&self) -> Vec<&str> {
        self.subject.split('/').filter(|s| !s.is_empty()).collect()
    }
}

/// Wire representation of the JSON envelope (§6). Decoupled from
/// [`Message`]/[`MessageReceived`] so transports can (de)serialize
/// independently of in-process bookkeeping fields like `sender`/`access`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub uid: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    pub timestamp: i64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl From<&Message> for Envelope {
    fn from(message: &Message) -> Self {
        Envelope {
            uid: message.uid.clone(),
            subject: message.subject.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            headers: message.headers.clone(),
        }
    }
}
