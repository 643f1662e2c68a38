//! MQTT reference transport: the broker-backed [`herald_core::Transport`]
//! implementation (§4.5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use herald_core::config::HeraldConfig;
use herald_core::error::TransportError;
use herald_core::message::{HEADER_REPLIES_TO, HEADER_SENDER_UID, HEADER_TARGET_GROUP, HEADER_TARGET_PEER};
use herald_core::{Extra, HeraldHandle, Message, MessageReceived, Peer, Transport};
use rumqttc::{Client, Connection, Event, LastWill, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::discovery::PeerContact;
use crate::models::{encode_payload, group_topic, uid_topic, will_topic, MqttAccess, ACCESS_ID, DEFAULT_TOPIC_PREFIX};

/// Connects to the broker, wires the reading half onto a dedicated OS
/// thread, and runs discovery/loop-suppression/routing for every inbound
/// publish (§4.5).
///
/// `publish()`/`subscribe()` on `rumqttc`'s synchronous [`Client`] only
/// enqueue onto an in-process channel — the actual network I/O runs on
/// `Connection`'s background thread, so `Transport::fire`/`fire_group`
/// here never block on the network themselves (§5).
pub struct MqttTransport {
    prefix: String,
    app_id: String,
    local_peer: Arc<Peer>,
    client: Client,
    raw_subjects: HashSet<String>,
    herald: HeraldHandle,
    contact: PeerContact,
}

impl MqttTransport {
    /// Connects to the broker configured in `config`, subscribes to this
    /// peer's topics, and announces it to the `all` group via discovery
    /// step1. The returned transport still needs to be bound with
    /// [`HeraldHandle::bind_transport`].
    pub fn connect(
        config: &HeraldConfig,
        local_peer: Arc<Peer>,
        herald: HeraldHandle,
    ) -> Result<Arc<MqttTransport>, TransportError> {
        Self::connect_with_raw_subjects(config, local_peer, herald, HashSet::new())
    }

    /// Like [`MqttTransport::connect`], but publishes/expects plain UTF-8
    /// text instead of a JSON envelope for any subject in `raw_subjects`.
    pub fn connect_with_raw_subjects(
        config: &HeraldConfig,
        local_peer: Arc<Peer>,
        herald: HeraldHandle,
        raw_subjects: HashSet<String>,
    ) -> Result<Arc<MqttTransport>, TransportError> {
        let prefix = DEFAULT_TOPIC_PREFIX.to_string();
        let app_id = config.application_id.clone();

        let client_id = format!("herald-{}", local_peer.uid());
        let mut options = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(username.clone(), config.mqtt_password.clone().unwrap_or_default());
        }

        let will_topic = will_topic(&prefix, &app_id);
        options.set_last_will(LastWill::new(
            will_topic.clone(),
            local_peer.uid().as_bytes().to_vec(),
            QoS::AtLeastOnce,
            false,
        ));

        let (client, connection) = Client::new(options, 64);

        client
            .subscribe(uid_topic(&prefix, &app_id, local_peer.uid()), QoS::AtLeastOnce)
            .map_err(TransportError::other)?;
        client
            .subscribe(group_topic(&prefix, &app_id, "all"), QoS::AtLeastOnce)
            .map_err(TransportError::other)?;
        client.subscribe(will_topic, QoS::AtLeastOnce).map_err(TransportError::other)?;
        for group in local_peer.groups() {
            client
                .subscribe(group_topic(&prefix, &app_id, &group), QoS::AtLeastOnce)
                .map_err(TransportError::other)?;
        }

        local_peer.set_access(ACCESS_ID, Arc::new(MqttAccess));

        let transport = Arc::new(MqttTransport {
            prefix,
            app_id,
            local_peer: local_peer.clone(),
            client,
            raw_subjects,
            herald: herald.clone(),
            contact: PeerContact::new(herald),
        });

        let worker = transport.clone();
        std::thread::spawn(move || worker.run_event_loop(connection));

        let dump = local_peer.dump();
        let announce = Message::new(
            "herald/discovery/step1",
            Some(serde_json::to_value(dump).unwrap_or(serde_json::Value::Null)),
        );
        transport.fire_group("all", &HashSet::new(), &announce)?;

        Ok(transport)
    }

    fn run_event_loop(&self, mut connection: Connection) {
        for notification in connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.on_publish(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "mqtt connection error");
                }
            }
        }
    }

    fn on_publish(&self, topic: &str, payload: &[u8]) {
        if topic == will_topic(&self.prefix, &self.app_id) {
            if let Ok(uid) = std::str::from_utf8(payload) {
                info!(uid, "peer reported down via last will");
                self.herald.directory().unregister(uid);
            }
            return;
        }

        let envelope = match crate::models::decode_envelope(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(%err, "dropping non-JSON mqtt payload");
                return;
            }
        };

        let Some(sender_uid) = envelope.headers.get(HEADER_SENDER_UID).cloned() else {
            debug!("dropping envelope with no sender header");
            return;
        };
        if sender_uid == self.local_peer.uid() {
            return; // loop suppression: we published this ourselves
        }
        let reply_to = envelope.headers.get(HEADER_REPLIES_TO).cloned();

        let mut extra = HashMap::new();
        extra.insert("sender_uid".to_string(), sender_uid.clone());
        extra.insert("parent_uid".to_string(), envelope.uid.clone());

        let received = MessageReceived {
            uid: envelope.uid,
            subject: envelope.subject,
            content: envelope.content,
            timestamp: envelope.timestamp,
            headers: envelope.headers,
            sender: sender_uid.clone(),
            reply_to,
            access: ACCESS_ID.to_string(),
            extra,
        };

        if received.subject.starts_with("herald/discovery/") {
            self.contact.handle(&received);
            return;
        }

        if self.herald.directory().get_peer(&sender_uid).is_err() {
            debug!(sender_uid, "dropping message from a peer we haven't discovered yet");
            return;
        }

        self.herald.handle_message(received);
    }

    fn apply_headers(&self, message: &mut Message, target_uid: Option<&str>, target_group: Option<&str>, parent_uid: Option<&str>) {
        message.add_header(HEADER_SENDER_UID, self.local_peer.uid());
        if let Some(uid) = target_uid {
            message.add_header(HEADER_TARGET_PEER, uid);
        }
        if let Some(group) = target_group {
            message.add_header(HEADER_TARGET_GROUP, group);
        }
        if let Some(parent) = parent_uid {
            message.add_header(HEADER_REPLIES_TO, parent);
        }
    }
}

impl Transport for MqttTransport {
    fn access_id(&self) -> &str {
        ACCESS_ID
    }

    fn fire(&self, peer: Option<&Arc<Peer>>, message: &Message, extra: Option<&Extra>) -> Result<(), TransportError> {
        let peer_uid = match peer {
            Some(peer) => {
                if !peer.has_access(ACCESS_ID) {
                    return Err(TransportError::InvalidPeerAccess(format!(
                        "peer {} has no mqtt access",
                        peer.uid()
                    )));
                }
                peer.uid().to_string()
            }
            None => extra
                .and_then(|extra| extra.get("sender_uid"))
                .cloned()
                .ok_or_else(|| TransportError::InvalidPeerAccess("no peer and no sender_uid in extra".to_string()))?,
        };
        let parent_uid = extra.and_then(|extra| extra.get("parent_uid")).cloned();

        let mut message = message.clone();
        self.apply_headers(&mut message, Some(&peer_uid), None, parent_uid.as_deref());
        let payload = encode_payload(&message, &self.raw_subjects);

        self.client
            .publish(uid_topic(&self.prefix, &self.app_id, &peer_uid), QoS::AtLeastOnce, false, payload)
            .map_err(TransportError::other)?;
        Ok(())
    }

    fn fire_group(&self, group: &str, peers: &HashSet<Arc<Peer>>, message: &Message) -> Result<HashSet<Arc<Peer>>, TransportError> {
        let mut message = message.clone();
        self.apply_headers(&mut message, None, Some(group), None);
        let payload = encode_payload(&message, &self.raw_subjects);

        self.client
            .publish(group_topic(&self.prefix, &self.app_id, group), QoS::AtLeastOnce, false, payload)
            .map_err(TransportError::other)?;
        Ok(peers.clone())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // The broker only publishes the last will on an ungraceful
        // disconnect; publish it ourselves first so peers notice promptly
        // on a clean shutdown too.
        let will_topic = will_topic(&self.prefix, &self.app_id);
        let _ = self
            .client
            .publish(will_topic, QoS::AtLeastOnce, false, self.local_peer.uid().as_bytes().to_vec());
        let _ = self.client.disconnect();
        self.local_peer.unset_access(ACCESS_ID);
    }
}
