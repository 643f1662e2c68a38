//! Peer identity and access descriptors.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A materialized, transport-specific access descriptor. Opaque to the
/// core; a [`crate::directory::TransportDirectory`] knows how to build one
/// from the JSON carried in a peer dump and how to render it back.
pub trait AccessDescriptor: Send + Sync + fmt::Debug {
    /// Content to store in a directory dump to describe this access.
    fn dump(&self) -> Value;
}

/// Capability a peer calls back into when one of its accesses changes.
///
/// The source looks this method up by name on a duck-typed "directory" and
/// silently no-ops when it's missing; here that's an explicit trait with
/// default (no-op) bodies so callers only override what they need.
pub trait DirectorySink: Send + Sync {
    fn peer_set_access(&self, _peer: &Peer, _access_id: &str, _data: &Arc<dyn AccessDescriptor>) {}
    fn peer_unset_access(&self, _peer: &Peer, _access_id: &str) {}
}

struct PeerState {
    name: String,
    node_uid: String,
    node_name: String,
    groups: Option<Vec<String>>,
    accesses: Vec<(String, Arc<dyn AccessDescriptor>)>,
}

/// A peer known to this process, local or remote.
///
/// Equality, hashing and ordering are all by `uid`, matching the source's
/// `@functools.total_ordering` bean.
pub struct Peer {
    uid: String,
    state: Mutex<PeerState>,
    directory: Mutex<Option<Weak<dyn DirectorySink>>>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").field("uid", &self.uid).finish()
    }
}

impl Peer {
    /// Creates a peer with all attributes defaulting to `uid`, as the source
    /// does before `name`/`node_uid`/`node_name` are set explicitly.
    ///
    /// Returns `None` if `uid` is empty.
    pub fn new(uid: impl Into<String>) -> Option<Arc<Peer>> {
        let uid = uid.into();
        if uid.is_empty() {
            return None;
        }
        Some(Arc::new(Peer {
            state: Mutex::new(PeerState {
                name: uid.clone(),
                node_uid: uid.clone(),
                node_name: uid.clone(),
                groups: None,
                accesses: Vec::new(),
            }),
            uid,
            directory: Mutex::new(None),
        }))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        let mut state = self.state.lock();
        state.name = name.unwrap_or_else(|| self.uid.clone());
    }

    pub fn node_uid(&self) -> String {
        self.state.lock().node_uid.clone()
    }

    pub fn set_node_uid(&self, node_uid: Option<String>) {
        let mut state = self.state.lock();
        state.node_uid = node_uid.unwrap_or_else(|| self.uid.clone());
    }

    pub fn node_name(&self) -> String {
        self.state.lock().node_name.clone()
    }

    pub fn set_node_name(&self, node_name: Option<String>) {
        let mut state = self.state.lock();
        state.node_name = node_name.unwrap_or_else(|| state.node_uid.clone());
    }

    pub fn groups(&self) -> Vec<String> {
        self.state.lock().groups.clone().unwrap_or_default()
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.groups().iter().any(|g| g == group)
    }

    /// Sets the groups this peer belongs to. Callable only once; later
    /// calls are ignored, mirroring the source's immutable-after-first-set
    /// semantics.
    pub fn set_groups(&self, groups: Vec<String>) {
        let mut state = self.state.lock();
        if state.groups.is_none() {
            state.groups = Some(groups);
        }
    }

    pub fn set_directory(&self, directory: Option<Weak<dyn DirectorySink>>) {
        *self.directory.lock() = directory;
    }

    fn callback(&self, f: impl FnOnce(&dyn DirectorySink)) {
        if let Some(sink) = self.directory.lock().as_ref().and_then(Weak::upgrade) {
            f(sink.as_ref());
        }
    }

    pub fn get_access(&self, access_id: &str) -> Option<Arc<dyn AccessDescriptor>> {
        self.state
            .lock()
            .accesses
            .iter()
            .find(|(id, _)| id == access_id)
            .map(|(_, data)| data.clone())
    }

    /// Access ids in insertion order, as required by `fire`'s fallback scan.
    pub fn access_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .accesses
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_access(&self, access_id: &str) -> bool {
        self.get_access(access_id).is_some()
    }

    pub fn set_access(&self, access_id: impl Into<String>, data: Arc<dyn AccessDescriptor>) {
        let access_id = access_id.into();
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.accesses.iter_mut().find(|(id, _)| *id == access_id) {
                entry.1 = data.clone();
            } else {
                state.accesses.push((access_id.clone(), data.clone()));
            }
        }
        self.callback(|sink| sink.peer_set_access(self, &access_id, &data));
    }

    pub fn unset_access(&self, access_id: &str) -> Option<Arc<dyn AccessDescriptor>> {
        let removed = {
            let mut state = self.state.lock();
            let index = state.accesses.iter().position(|(id, _)| id == access_id)?;
            Some(state.accesses.remove(index).1)
        };
        if removed.is_some() {
            self.callback(|sink| sink.peer_unset_access(self, access_id));
        }
        removed
    }

    /// Canonical serialized form used for directory exchange (§6). The
    /// source's `dump()` accidentally builds a set instead of a mapping;
    /// this schema is the corrected, authoritative one.
    pub fn dump(&self) -> PeerDump {
        let state = self.state.lock();
        PeerDump {
            uid: self.uid.clone(),
            name: state.name.clone(),
            node_uid: state.node_uid.clone(),
            node_name: state.node_name.clone(),
            groups: state.groups.clone().unwrap_or_default(),
            accesses: state
                .accesses
                .iter()
                .map(|(id, data)| (id.clone(), data.dump()))
                .collect(),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}
impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl PartialOrd for Peer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Peer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.uid.cmp(&other.uid)
    }
}

/// Canonical peer dump, as exchanged during discovery (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDump {
    pub uid: String,
    pub name: String,
    pub node_uid: String,
    pub node_name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub accesses: HashMap<String, Value>,
}
