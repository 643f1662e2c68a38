//! Transport directory for the MQTT access id.

use std::sync::Arc;

use herald_core::directory::TransportDirectory;
use herald_core::{AccessDescriptor, HeraldError};
use serde_json::Value;

use crate::models::{MqttAccess, ACCESS_ID};

/// MQTT's directory is stateless: every peer dump carrying an `mqtt` access
/// materializes to the same marker descriptor, and there's nothing to do
/// when an access is set or unset.
#[derive(Debug, Default)]
pub struct MqttTransportDirectory;

impl MqttTransportDirectory {
    pub fn new() -> Self {
        MqttTransportDirectory
    }
}

impl TransportDirectory for MqttTransportDirectory {
    fn access_id(&self) -> &str {
        ACCESS_ID
    }

    fn load_access(&self, _data: &Value) -> Result<Arc<dyn AccessDescriptor>, HeraldError> {
        Ok(Arc::new(MqttAccess))
    }
}
