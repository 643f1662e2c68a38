//! Pluggable transport abstraction and the multiplex that selects among
//! bound transports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::TransportError;
use crate::message::Message;
use crate::peer::Peer;

/// Opaque, transport-specific data needed to route a reply back through
/// the same connection a message arrived on (e.g. MQTT's
/// `sender_uid`/`parent_uid`).
pub type Extra = HashMap<String, String>;

/// A single wire protocol a peer can be reached over.
///
/// Implementations must not block on network I/O beyond handing the
/// payload to the broker client's internal queue (§5) — the engine never
/// holds a lock across a call into a transport.
pub trait Transport: Send + Sync {
    /// The access id this transport advertises (e.g. `"mqtt"`).
    fn access_id(&self) -> &str;

    /// Fires a message at a single peer. `extra` carries the bookkeeping
    /// needed to reply to a message received on this transport when the
    /// target peer isn't (yet) known to the directory.
    fn fire(
        &self,
        peer: Option<&Arc<Peer>>,
        message: &Message,
        extra: Option<&Extra>,
    ) -> Result<(), TransportError>;

    /// Fires a message at every peer in `peers` belonging to `group`.
    /// Returns the subset of `peers` this transport claims to have
    /// reached, used by the caller to compute group-fire coverage.
    fn fire_group(
        &self,
        group: &str,
        peers: &HashSet<Arc<Peer>>,
        message: &Message,
    ) -> Result<HashSet<Arc<Peer>>, TransportError>;
}

/// Registry of bound transports, keyed by access id.
#[derive(Default)]
pub struct Multiplex {
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
}

impl Multiplex {
    pub fn new() -> Self {
        Multiplex::default()
    }

    /// Binds a transport. The engine activates its public controller while
    /// at least one transport is bound (§4.4).
    pub fn bind(&self, transport: Arc<dyn Transport>) {
        self.transports
            .write()
            .insert(transport.access_id().to_string(), transport);
    }

    pub fn unbind(&self, access_id: &str) -> Option<Arc<dyn Transport>> {
        self.transports.write().remove(access_id)
    }

    pub fn get(&self, access_id: &str) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(access_id).cloned()
    }

    pub fn is_active(&self) -> bool {
        !self.transports.read().is_empty()
    }

    /// Drops every bound transport. Any transport whose `Drop` impl sends a
    /// farewell (e.g. MQTT's last-will) runs it here (§5).
    pub fn clear(&self) {
        self.transports.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTransport;
    impl Transport for NoopTransport {
        fn access_id(&self) -> &str {
            "noop"
        }
        fn fire(
            &self,
            _peer: Option<&Arc<Peer>>,
            _message: &Message,
            _extra: Option<&Extra>,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        fn fire_group(
            &self,
            _group: &str,
            peers: &HashSet<Arc<Peer>>,
            _message: &Message,
        ) -> Result<HashSet<Arc<Peer>>, TransportError> {
            Ok(peers.clone())
        }
    }

    #[test]
    fn active_only_while_a_transport_is_bound() {
        let multiplex = Multiplex::new();
        assert!(!multiplex.is_active());
        multiplex.bind(Arc::new(NoopTransport));
        assert!(multiplex.is_active());
        multiplex.unbind("noop");
        assert!(!multiplex.is_active());
    }
}
