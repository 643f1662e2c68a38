//! Three-step peer-contact handshake run over `herald/discovery/*` (§4.6).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use herald_core::{HeraldHandle, MessageReceived, PeerDump};
use parking_lot::Mutex;
use serde_json::Value;

/// Window within which a repeated `step1` from the same sender is treated
/// as a duplicate rather than a fresh handshake, pruned opportunistically
/// on every `step1` seen.
const DEDUP_WINDOW: Duration = Duration::from_secs(5);

pub const SUBJECT_STEP1: &str = "herald/discovery/step1";
pub const SUBJECT_STEP2: &str = "herald/discovery/step2";
pub const SUBJECT_STEP3: &str = "herald/discovery/step3";

/// Runs the newcomer/welcome/bye-free handshake that gets a peer into the
/// directory before any ordinary message can reach it.
pub struct PeerContact {
    herald: HeraldHandle,
    in_flight: Mutex<HashMap<String, Instant>>,
}

impl PeerContact {
    pub fn new(herald: HeraldHandle) -> Self {
        PeerContact {
            herald,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatches a `herald/discovery/*` message to its step handler.
    pub fn handle(&self, received: &MessageReceived) {
        match received.subject.as_str() {
            SUBJECT_STEP1 => self.handle_step1(received),
            SUBJECT_STEP2 => self.handle_step2(received),
            SUBJECT_STEP3 => self.handle_step3(received),
            _ => {}
        }
    }

    fn prune(&self, now: Instant) {
        self.in_flight
            .lock()
            .retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
    }

    fn is_duplicate_step1(&self, sender: &str) -> bool {
        let now = Instant::now();
        self.prune(now);
        let mut in_flight = self.in_flight.lock();
        let duplicate = matches!(in_flight.get(sender), Some(seen) if now.duration_since(*seen) < DEDUP_WINDOW);
        in_flight.insert(sender.to_string(), now);
        duplicate
    }

    fn handle_step1(&self, received: &MessageReceived) {
        let duplicate = self.is_duplicate_step1(&received.sender);
        let Some(dump) = decode_dump(received) else {
            return;
        };
        if self.herald.directory().register(&dump).is_err() {
            return;
        }
        if duplicate {
            tracing::debug!(sender = %received.sender, "duplicate discovery step1, still replying");
        }

        let welcome = self.herald.local_peer().dump();
        let _ = self.herald.reply(
            received,
            Some(serde_json::to_value(welcome).unwrap_or(Value::Null)),
            Some(SUBJECT_STEP2),
        );
    }

    fn handle_step2(&self, received: &MessageReceived) {
        let Some(dump) = decode_dump(received) else {
            return;
        };
        if self.herald.directory().register(&dump).is_err() {
            return;
        }
        let _ = self.herald.reply(received, None, Some(SUBJECT_STEP3));
    }

    fn handle_step3(&self, _received: &MessageReceived) {
        // Handshake terminates here; registration already committed in step2.
    }
}

fn decode_dump(received: &MessageReceived) -> Option<PeerDump> {
    serde_json::from_value(received.content.clone()?).ok()
}
