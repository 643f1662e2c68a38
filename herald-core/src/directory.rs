//! Thread-safe registry of known peers, keyed by UID, node and group.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::HeraldError;
use crate::peer::{AccessDescriptor, DirectorySink, Peer, PeerDump};

/// Identifies a registered or unregistered peer by UID or by dump.
pub enum PeerRef<'a> {
    Uid(&'a str),
    Dump(&'a PeerDump),
}

impl<'a> PeerRef<'a> {
    fn uid(&self) -> &str {
        match self {
            PeerRef::Uid(uid) => uid,
            PeerRef::Dump(dump) => &dump.uid,
        }
    }
}

impl<'a> From<&'a str> for PeerRef<'a> {
    fn from(uid: &'a str) -> Self {
        PeerRef::Uid(uid)
    }
}
impl<'a> From<&'a PeerDump> for PeerRef<'a> {
    fn from(dump: &'a PeerDump) -> Self {
        PeerRef::Dump(dump)
    }
}

/// How a transport's access descriptors are materialized from, and
/// notified about, directory changes (§4.1/§4.4).
pub trait TransportDirectory: Send + Sync {
    /// The `access_id` this directory handles (e.g. `"mqtt"`).
    fn access_id(&self) -> &str;

    /// Builds an [`AccessDescriptor`] from the opaque JSON a peer dump
    /// carries for this access id.
    fn load_access(&self, data: &Value) -> Result<Arc<dyn AccessDescriptor>, HeraldError>;

    /// Called after a peer's access for this transport has been set.
    fn peer_access_set(&self, _peer: &Peer, _data: &Arc<dyn AccessDescriptor>) {}

    /// Called after a peer's access for this transport has been removed.
    fn peer_access_unset(&self, _peer: &Peer, _access_id: &str) {}
}

/// Thread-safe registry of peers, shared by the engine and every bound
/// transport.
///
/// Reads (`get_peer`, `get_peers_for_group`, ...) take a shared lock and
/// never block each other; mutations (`register`, `unregister`, transport
/// directory (un)registration) serialize through the same `RwLock`'s
/// exclusive mode.
pub struct Directory {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    local_uid: String,
    transport_dirs: RwLock<HashMap<String, Arc<dyn TransportDirectory>>>,
}

impl Directory {
    /// Creates a directory seeded with the local peer, which is registered
    /// like any other (so it participates in group lookups).
    pub fn new(local_peer: Arc<Peer>) -> Arc<Directory> {
        let local_uid = local_peer.uid().to_string();
        let directory = Arc::new(Directory {
            peers: RwLock::new(HashMap::new()),
            local_uid: local_uid.clone(),
            transport_dirs: RwLock::new(HashMap::new()),
        });
        let sink: Weak<dyn DirectorySink> = Arc::downgrade(&directory) as Weak<dyn DirectorySink>;
        local_peer.set_directory(Some(sink));
        directory.peers.write().insert(local_uid, local_peer);
        directory
    }

    pub fn get_local_peer(&self) -> Arc<Peer> {
        self.peers
            .read()
            .get(&self.local_uid)
            .cloned()
            .expect("local peer always present")
    }

    pub fn get_peer(&self, uid: &str) -> Result<Arc<Peer>, HeraldError> {
        self.peers
            .read()
            .get(uid)
            .cloned()
            .ok_or_else(|| HeraldError::UnknownPeer(uid.to_string()))
    }

    /// An empty result is a legal answer, not an error.
    pub fn get_peers_for_group(&self, group: &str) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.is_in_group(group))
            .cloned()
            .collect()
    }

    pub fn register_transport_directory(&self, dir: Arc<dyn TransportDirectory>) {
        self.transport_dirs
            .write()
            .insert(dir.access_id().to_string(), dir);
    }

    pub fn unregister_transport_directory(&self, access_id: &str) {
        self.transport_dirs.write().remove(access_id);
    }

    /// Registers (or updates) a peer from its dump. Materializes every
    /// access whose id has a bound transport directory.
    pub fn register(&self, dump: &PeerDump) -> Result<Arc<Peer>, HeraldError> {
        let peer = {
            let mut peers = self.peers.write();
            match peers.get(&dump.uid) {
                Some(existing) => existing.clone(),
                None => {
                    let created = Peer::new(dump.uid.clone())
                        .ok_or_else(|| HeraldError::UnknownPeer(dump.uid.clone()))?;
                    peers.insert(dump.uid.clone(), created.clone());
                    created
                }
            }
        };

        peer.set_name(Some(dump.name.clone()));
        peer.set_node_uid(Some(dump.node_uid.clone()));
        peer.set_node_name(Some(dump.node_name.clone()));
        peer.set_groups(dump.groups.clone());

        // Note: not held across `peer.set_access`, which calls back into
        // `peer_set_access`/the transport directory below.
        let directories: Vec<Arc<dyn TransportDirectory>> =
            self.transport_dirs.read().values().cloned().collect();

        for (access_id, data) in &dump.accesses {
            if let Some(transport_dir) = directories.iter().find(|d| d.access_id() == access_id) {
                match transport_dir.load_access(data) {
                    Ok(descriptor) => peer.set_access(access_id.clone(), descriptor),
                    Err(err) => debug!(%access_id, %err, "failed to load peer access"),
                }
            }
        }

        Ok(peer)
    }

    /// Unregisters a peer, unsetting its accesses in reverse order.
    pub fn unregister<'a>(&self, target: impl Into<PeerRef<'a>>) -> Option<Arc<Peer>> {
        let target = target.into();
        let peer = self.peers.write().remove(target.uid())?;

        let mut access_ids = peer.access_ids();
        access_ids.reverse();
        for access_id in access_ids {
            peer.unset_access(&access_id);
        }

        Some(peer)
    }
}

impl DirectorySink for Directory {
    fn peer_set_access(&self, peer: &Peer, access_id: &str, data: &Arc<dyn AccessDescriptor>) {
        if let Some(transport_dir) = self.transport_dirs.read().get(access_id) {
            transport_dir.peer_access_set(peer, data);
        }
    }

    fn peer_unset_access(&self, peer: &Peer, access_id: &str) {
        if let Some(transport_dir) = self.transport_dirs.read().get(access_id) {
            transport_dir.peer_access_unset(peer, access_id);
        }
    }
}
