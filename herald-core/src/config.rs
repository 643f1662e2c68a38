//! Configuration keys the engine recognizes (§6).

/// Local peer identity and broker endpoint, loadable from environment
/// variables (`HERALD_*`) before a consuming binary layers CLI flags on
/// top.
#[derive(Debug, Clone)]
pub struct HeraldConfig {
    pub node_uid: String,
    pub node_name: String,
    pub peer_name: String,
    pub application_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
}

const DEFAULT_MQTT_HOST: &str = "localhost";
const DEFAULT_MQTT_PORT: u16 = 1883;

impl HeraldConfig {
    /// Builds a config from `node_uid`, defaulting every other identity
    /// field to it, and the MQTT broker defaults (§6).
    pub fn new(node_uid: impl Into<String>) -> Self {
        let node_uid = node_uid.into();
        HeraldConfig {
            node_name: node_uid.clone(),
            peer_name: node_uid.clone(),
            application_id: "herald".to_string(),
            node_uid,
            mqtt_host: DEFAULT_MQTT_HOST.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_username: None,
            mqtt_password: None,
        }
    }

    /// Overlays any `HERALD_*` environment variables that are set, leaving
    /// `self`'s values as the defaults otherwise.
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("HERALD_NODE_UID") {
            self.node_uid = v;
        }
        if let Ok(v) = std::env::var("HERALD_NODE_NAME") {
            self.node_name = v;
        }
        if let Ok(v) = std::env::var("HERALD_PEER_NAME") {
            self.peer_name = v;
        }
        if let Ok(v) = std::env::var("HERALD_APPLICATION_ID") {
            self.application_id = v;
        }
        if let Ok(v) = std::env::var("HERALD_MQTT_HOST") {
            self.mqtt_host = v;
        }
        if let Ok(v) = std::env::var("HERALD_MQTT_PORT") {
            if let Ok(port) = v.parse() {
                self.mqtt_port = port;
            }
        }
        if let Ok(v) = std::env::var("HERALD_MQTT_USERNAME") {
            self.mqtt_username = Some(v);
        }
        if let Ok(v) = std::env::var("HERALD_MQTT_PASSWORD") {
            self.mqtt_password = Some(v);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_node_uid_and_broker_defaults() {
        let config = HeraldConfig::new("node-a");
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.peer_name, "node-a");
        assert_eq!(config.mqtt_host, "localhost");
        assert_eq!(config.mqtt_port, 1883);
    }
}
