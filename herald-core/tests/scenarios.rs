//! End-to-end scenarios run against an in-memory test transport — no
//! broker needed to exercise the correlation engine itself.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use herald_core::directory::TransportDirectory;
use herald_core::error::HeraldError;
use herald_core::transport::Extra;
use herald_core::{
    AccessDescriptor, HeraldConfig, HeraldHandle, Message, MessageListener, MessageReceived, Peer,
    PeerDump, Transport,
};
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug)]
struct TestAccess;
impl AccessDescriptor for TestAccess {
    fn dump(&self) -> Value {
        Value::Bool(true)
    }
}

struct TestTransportDirectory {
    access_id: String,
}
impl TestTransportDirectory {
    fn new(access_id: &str) -> Self {
        TestTransportDirectory {
            access_id: access_id.to_string(),
        }
    }
}
impl TransportDirectory for TestTransportDirectory {
    fn access_id(&self) -> &str {
        &self.access_id
    }
    fn load_access(&self, _data: &Value) -> Result<Arc<dyn AccessDescriptor>, HeraldError> {
        Ok(Arc::new(TestAccess))
    }
}

/// Shared routing table standing in for a broker: maps a peer's uid to its
/// engine so a [`TestTransport`] can hand a message straight to the right
/// `handle_message`.
#[derive(Default)]
struct TestNetwork {
    handles: Mutex<HashMap<String, HeraldHandle>>,
}
impl TestNetwork {
    fn new() -> Arc<Self> {
        Arc::new(TestNetwork::default())
    }
    fn register(&self, uid: &str, handle: HeraldHandle) {
        self.handles.lock().insert(uid.to_string(), handle);
    }
    fn get(&self, uid: &str) -> Option<HeraldHandle> {
        self.handles.lock().get(uid).cloned()
    }
}

/// An in-memory transport. Delivery is handed to `tokio::spawn` rather than
/// called inline, so a `forget()` issued right after `fire`/`post` races the
/// delivery exactly the way it would over a real network hop.
struct TestTransport {
    access_id: String,
    owner_uid: String,
    network: Arc<TestNetwork>,
}
impl TestTransport {
    fn new(access_id: &str, owner_uid: &str, network: Arc<TestNetwork>) -> Self {
        TestTransport {
            access_id: access_id.to_string(),
            owner_uid: owner_uid.to_string(),
            network,
        }
    }
}

impl Transport for TestTransport {
    fn access_id(&self) -> &str {
        &self.access_id
    }

    fn fire(&self, peer: Option<&Arc<Peer>>, message: &Message, extra: Option<&Extra>) -> Result<(), herald_core::error::TransportError> {
        let peer_uid = peer
            .map(|p| p.uid().to_string())
            .or_else(|| extra.and_then(|e| e.get("sender_uid")).cloned())
            .ok_or_else(|| herald_core::error::TransportError::InvalidPeerAccess("no peer and no sender_uid".to_string()))?;
        let Some(target) = self.network.get(&peer_uid) else {
            return Err(herald_core::error::TransportError::InvalidPeerAccess(format!(
                "peer {peer_uid} not reachable"
            )));
        };

        let reply_to = extra.and_then(|e| e.get("parent_uid")).cloned();
        let mut fwd_extra = HashMap::new();
        fwd_extra.insert("sender_uid".to_string(), self.owner_uid.clone());
        fwd_extra.insert("parent_uid".to_string(), message.uid.clone());

        let received = MessageReceived {
            uid: message.uid.clone(),
            subject: message.subject.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            headers: message.headers.clone(),
            sender: self.owner_uid.clone(),
            reply_to,
            access: self.access_id.clone(),
            extra: fwd_extra,
        };
        tokio::spawn(async move { target.handle_message(received) });
        Ok(())
    }

    fn fire_group(
        &self,
        _group: &str,
        peers: &HashSet<Arc<Peer>>,
        message: &Message,
    ) -> Result<HashSet<Arc<Peer>>, herald_core::error::TransportError> {
        let mut reached = HashSet::new();
        for peer in peers {
            if !peer.has_access(&self.access_id) {
                continue;
            }
            let Some(target) = self.network.get(peer.uid()) else {
                continue;
            };
            let received = MessageReceived {
                uid: message.uid.clone(),
                subject: message.subject.clone(),
                content: message.content.clone(),
                timestamp: message.timestamp,
                headers: message.headers.clone(),
                sender: self.owner_uid.clone(),
                reply_to: None,
                access: self.access_id.clone(),
                extra: HashMap::new(),
            };
            tokio::spawn(async move { target.handle_message(received) });
            reached.insert(peer.clone());
        }
        Ok(reached)
    }
}

fn make_engine(uid: &str) -> HeraldHandle {
    let config = HeraldConfig::new(uid);
    let engine = HeraldHandle::new(&config);
    engine.register_transport_directory(Arc::new(TestTransportDirectory::new("mqtt")));
    engine.register_transport_directory(Arc::new(TestTransportDirectory::new("other")));
    engine
}

fn register_peer(engine: &HeraldHandle, uid: &str, access_ids: &[&str], groups: &[&str]) {
    let mut accesses = HashMap::new();
    for access_id in access_ids {
        accesses.insert(access_id.to_string(), Value::Bool(true));
    }
    let dump = PeerDump {
        uid: uid.to_string(),
        name: uid.to_string(),
        node_uid: uid.to_string(),
        node_name: uid.to_string(),
        groups: groups.iter().map(|g| g.to_string()).collect(),
        accesses,
    };
    engine.directory().register(&dump).unwrap();
}

fn filters(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

struct EchoListener;
impl MessageListener for EchoListener {
    fn herald_message(&self, herald: &HeraldHandle, message: &MessageReceived) {
        let _ = herald.reply(message, message.content.clone(), None);
    }
}

struct NoopListener;
impl MessageListener for NoopListener {
    fn herald_message(&self, _herald: &HeraldHandle, _message: &MessageReceived) {}
}

struct CountingListener(Arc<AtomicUsize>, &'static str);
impl MessageListener for CountingListener {
    fn herald_message(&self, _herald: &HeraldHandle, message: &MessageReceived) {
        if message.subject == self.1 {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn request_reply_happy_path() {
    let network = TestNetwork::new();
    let a = make_engine("peer-a");
    let b = make_engine("peer-b");
    network.register("peer-a", a.clone());
    network.register("peer-b", b.clone());

    a.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-a", network.clone())));
    b.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-b", network.clone())));
    register_peer(&a, "peer-b", &["mqtt"], &[]);
    register_peer(&b, "peer-a", &["mqtt"], &[]);

    b.bind_listener(filters(&["demo/*"]), Arc::new(EchoListener));

    let message = Message::new("demo/echo", Some(Value::String("hi".to_string())));
    let sent_uid = message.uid.clone();

    let reply = a
        .send("peer-b", message, Duration::from_secs(2))
        .await
        .expect("expected a reply");

    assert_eq!(reply.content, Some(Value::String("hi".to_string())));
    assert_eq!(reply.reply_to.as_deref(), Some(sent_uid.as_str()));
}

#[tokio::test]
async fn no_listener_raises_and_notifies_sender() {
    let network = TestNetwork::new();
    let a = make_engine("peer-a");
    let b = make_engine("peer-b");
    network.register("peer-a", a.clone());
    network.register("peer-b", b.clone());

    a.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-a", network.clone())));
    b.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-b", network.clone())));
    register_peer(&a, "peer-b", &["mqtt"], &[]);
    register_peer(&b, "peer-a", &["mqtt"], &[]);

    let message = Message::new("nobody/home", None);
    let err = a
        .send("peer-b", message, Duration::from_secs(2))
        .await
        .expect_err("expected no-listener error");

    match err {
        HeraldError::NoListener { subject, .. } => assert_eq!(subject, "nobody/home"),
        other => panic!("expected NoListener, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_clears_the_waiter() {
    let network = TestNetwork::new();
    let a = make_engine("peer-a");
    let b = make_engine("peer-b");
    network.register("peer-a", a.clone());
    network.register("peer-b", b.clone());

    a.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-a", network.clone())));
    b.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-b", network.clone())));
    register_peer(&a, "peer-b", &["mqtt"], &[]);
    register_peer(&b, "peer-a", &["mqtt"], &[]);

    b.bind_listener(filters(&["demo/*"]), Arc::new(NoopListener));

    let message = Message::new("demo/silence", None);
    let sent_uid = message.uid.clone();

    let started = tokio::time::Instant::now();
    let err = a
        .send("peer-b", message, Duration::from_millis(200))
        .await
        .expect_err("expected a timeout");
    assert!(started.elapsed() >= Duration::from_millis(200));

    match err {
        HeraldError::HeraldTimeout(_) => {}
        other => panic!("expected HeraldTimeout, got {other:?}"),
    }

    // The waiter must already be gone: forgetting it again finds nothing.
    assert!(!a.forget(&sent_uid));
}

#[tokio::test]
async fn group_fan_out_with_partial_coverage() {
    let network = TestNetwork::new();
    let a = make_engine("peer-a");
    let b = make_engine("peer-b");
    let c = make_engine("peer-c");
    network.register("peer-a", a.clone());
    network.register("peer-b", b.clone());
    network.register("peer-c", c.clone());

    a.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-a", network.clone())));
    b.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-b", network.clone())));
    c.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-c", network.clone())));

    register_peer(&a, "peer-b", &["mqtt"], &["workers"]);
    register_peer(&a, "peer-c", &["mqtt"], &["workers"]);
    register_peer(&a, "peer-d", &["other"], &["workers"]);

    let b_count = Arc::new(AtomicUsize::new(0));
    let c_count = Arc::new(AtomicUsize::new(0));
    b.bind_listener(filters(&["demo/*"]), Arc::new(CountingListener(b_count.clone(), "demo/broadcast")));
    c.bind_listener(filters(&["demo/*"]), Arc::new(CountingListener(c_count.clone(), "demo/broadcast")));

    let message = Message::new("demo/broadcast", None);
    let (uid, unreached) = a.fire_group("workers", &message).unwrap();

    assert_eq!(uid, message.uid);
    assert_eq!(unreached.len(), 1);
    assert_eq!(unreached.iter().next().unwrap().uid(), "peer-d");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b_count.load(Ordering::SeqCst), 1);
    assert_eq!(c_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forget_cancels_a_post() {
    let network = TestNetwork::new();
    let a = make_engine("peer-a");
    let b = make_engine("peer-b");
    network.register("peer-a", a.clone());
    network.register("peer-b", b.clone());

    a.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-a", network.clone())));
    b.bind_transport(Arc::new(TestTransport::new("mqtt", "peer-b", network.clone())));
    register_peer(&a, "peer-b", &["mqtt"], &[]);
    register_peer(&b, "peer-a", &["mqtt"], &[]);
    // `b` deliberately has no listener bound: if the post weren't forgotten
    // first, the no-listener bounce would eventually resolve it instead.

    let message = Message::new("demo/ping", None);
    let uid = message.uid.clone();

    let errback_calls = Arc::new(AtomicUsize::new(0));
    let seen_error: Arc<Mutex<Option<HeraldError>>> = Arc::new(Mutex::new(None));

    let errback_calls_clone = errback_calls.clone();
    let seen_error_clone = seen_error.clone();
    a.post(
        "peer-b",
        message,
        |_herald, _reply| {},
        move |_herald, err| {
            errback_calls_clone.fetch_add(1, Ordering::SeqCst);
            *seen_error_clone.lock() = Some(err.clone());
        },
        Some(Duration::from_secs(60)),
        true,
    )
    .unwrap();

    // Nothing has been `.await`ed yet, so the delivery task spawned by
    // `fire` inside `post` hasn't run: this really does race ahead of it.
    assert!(a.forget(&uid));

    assert_eq!(errback_calls.load(Ordering::SeqCst), 1);
    match seen_error.lock().take() {
        Some(HeraldError::ForgotMessage(forgotten_uid)) => assert_eq!(forgotten_uid, uid),
        other => panic!("expected ForgotMessage, got {other:?}"),
    }
}
