//! MQTT reference transport for `herald-core` (§4.5, §4.6).

pub mod directory;
pub mod discovery;
pub mod models;
pub mod transport;

pub use directory::MqttTransportDirectory;
pub use discovery::PeerContact;
pub use models::{MqttAccess, ACCESS_ID, DEFAULT_TOPIC_PREFIX};
pub use transport::MqttTransport;
