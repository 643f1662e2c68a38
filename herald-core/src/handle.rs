//! The correlation engine: Herald's public messaging API.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::HeraldConfig;
use crate::directory::{Directory, TransportDirectory};
use crate::error::HeraldError;
use crate::listeners::{ListenerId, ListenerRegistry, MessageListener};
use crate::message::{Message, MessageReceived};
use crate::peer::{Peer, PeerDump};
use crate::transport::{Multiplex, Transport};
use crate::workers::{Job, WorkerPool};

/// How long a `post()` waits for a reply before it's silently forgotten,
/// unless the caller asks for something else.
pub const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(180);

/// Something `fire`/`send`/`post` can be addressed at.
pub enum Target {
    Uid(String),
    Peer(Arc<Peer>),
}

impl From<&str> for Target {
    fn from(uid: &str) -> Self {
        Target::Uid(uid.to_string())
    }
}
impl From<String> for Target {
    fn from(uid: String) -> Self {
        Target::Uid(uid)
    }
}
impl From<Arc<Peer>> for Target {
    fn from(peer: Arc<Peer>) -> Self {
        Target::Peer(peer)
    }
}
impl From<&Arc<Peer>> for Target {
    fn from(peer: &Arc<Peer>) -> Self {
        Target::Peer(peer.clone())
    }
}

enum SyncOutcome {
    Reply(Box<MessageReceived>),
    Error(HeraldError),
    Shutdown,
}

type CallbackFn = dyn Fn(&HeraldHandle, &MessageReceived) + Send + Sync;
type ErrbackFn = dyn Fn(&HeraldHandle, &HeraldError) + Send + Sync;

struct WaitingPost {
    callback: Arc<CallbackFn>,
    errback: Arc<ErrbackFn>,
    deadline: Option<Instant>,
    forget_on_first: bool,
}

struct Inner {
    directory: Arc<Directory>,
    listeners: ListenerRegistry,
    multiplex: Multiplex,
    pool: Mutex<Option<WorkerPool>>,
    sync_waiters: Mutex<HashMap<String, oneshot::Sender<SyncOutcome>>>,
    post_waiters: Mutex<HashMap<String, WaitingPost>>,
    gc_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    active: AtomicBool,
}

/// A cloneable handle to a running Herald engine.
///
/// Cloning is cheap (an `Arc` bump); every clone refers to the same
/// directory, listeners and waiter tables. The engine's lifetime is bounded
/// by [`HeraldHandle::new`] and [`HeraldHandle::shutdown`] — there is no
/// ambient global instance.
#[derive(Clone)]
pub struct HeraldHandle(Arc<Inner>);

fn is_internal_subject(subject: &str) -> bool {
    subject
        .split('/')
        .find(|part| !part.is_empty())
        .map(|part| part == "herald")
        .unwrap_or(false)
}

/// Runs `f`, logging and swallowing a panic instead of letting it escape —
/// the Rust equivalent of the source's "catch and log" treatment of
/// listener and callback exceptions (§4.3.2, §7).
fn call_safely(label: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::error!(label, "listener/callback panicked; delivery continues");
    }
}

impl HeraldHandle {
    /// Starts a new engine with a freshly built local peer (§6 identity
    /// keys). Spawns the worker pool and the 30s garbage-collection task.
    pub fn new(config: &HeraldConfig) -> HeraldHandle {
        let local_peer = Peer::new(config.node_uid.clone()).expect("node.uid must not be empty");
        local_peer.set_name(Some(config.peer_name.clone()));
        local_peer.set_node_uid(Some(config.node_uid.clone()));
        local_peer.set_node_name(Some(config.node_name.clone()));
        let directory = Directory::new(local_peer);

        let inner = Arc::new(Inner {
            directory,
            listeners: ListenerRegistry::new(),
            multiplex: Multiplex::new(),
            pool: Mutex::new(Some(WorkerPool::start())),
            sync_waiters: Mutex::new(HashMap::new()),
            post_waiters: Mutex::new(HashMap::new()),
            gc_handle: Mutex::new(None),
            active: AtomicBool::new(true),
        });

        let weak_inner = Arc::downgrade(&inner);
        let gc_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                match weak_inner.upgrade() {
                    Some(inner) => Inner::garbage_collect(&inner),
                    None => break,
                }
            }
        });
        *inner.gc_handle.lock() = Some(gc_handle);

        HeraldHandle(inner)
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.0.directory
    }

    pub fn local_peer(&self) -> Arc<Peer> {
        self.0.directory.get_local_peer()
    }

    pub fn register_transport_directory(&self, transport_directory: Arc<dyn TransportDirectory>) {
        self.0.directory.register_transport_directory(transport_directory);
    }

    /// Binds a transport. The engine's public controller activates while at
    /// least one transport is bound (§4.4).
    pub fn bind_transport(&self, transport: Arc<dyn Transport>) {
        self.0.multiplex.bind(transport);
    }

    pub fn unbind_transport(&self, access_id: &str) {
        self.0.multiplex.unbind(access_id);
    }

    pub fn is_active(&self) -> bool {
        self.0.multiplex.is_active()
    }

    pub fn bind_listener(
        &self,
        filters: HashSet<String>,
        listener: Arc<dyn MessageListener>,
    ) -> ListenerId {
        self.0.listeners.bind(filters, listener)
    }

    pub fn update_listener(&self, id: ListenerId, filters: HashSet<String>) {
        self.0.listeners.update(id, filters);
    }

    pub fn unbind_listener(&self, id: ListenerId) {
        self.0.listeners.unbind(id);
    }

    fn resolve_target(&self, target: impl Into<Target>) -> Result<Arc<Peer>, HeraldError> {
        match target.into() {
            Target::Uid(uid) => self.0.directory.get_peer(&uid),
            Target::Peer(peer) => Ok(peer),
        }
    }

    fn rejects_while_shutting_down(&self) -> Option<HeraldError> {
        if self.0.active.load(Ordering::SeqCst) {
            None
        } else {
            Some(HeraldError::NoTransport("herald is shutting down".to_string()))
        }
    }

    /// Fires (and forgets) `message` at `target`. Tries each of the
    /// resolved peer's accesses, in the order the peer declared them,
    /// falling back past both `InvalidPeerAccess` and ordinary transport
    /// errors until one succeeds (§4.3, §7).
    pub fn fire(&self, target: impl Into<Target>, message: &Message) -> Result<String, HeraldError> {
        if let Some(err) = self.rejects_while_shutting_down() {
            return Err(err);
        }
        let peer = self.resolve_target(target)?;
        if !self.0.multiplex.is_active() {
            return Err(HeraldError::NoTransport("no transport bound yet".to_string()));
        }

        let mut last_error: Option<String> = None;
        for access_id in peer.access_ids() {
            let Some(transport) = self.0.multiplex.get(&access_id) else {
                continue;
            };
            match transport.fire(Some(&peer), message, None) {
                Ok(()) => return Ok(message.uid.clone()),
                Err(err) => {
                    debug!(%access_id, %err, "transport rejected fire, trying next access");
                    last_error = Some(err.to_string());
                }
            }
        }

        Err(HeraldError::NoTransport(match last_error {
            Some(reason) => format!("no transport found for peer {} ({reason})", peer.uid()),
            None => format!("no transport found for peer {}", peer.uid()),
        }))
    }

    fn fire_group_coverage(
        &self,
        group: &str,
        message: &Message,
    ) -> Result<(String, HashSet<Arc<Peer>>), HeraldError> {
        if !self.0.multiplex.is_active() {
            return Err(HeraldError::NoTransport("no transport bound yet".to_string()));
        }

        let all_peers = self.0.directory.get_peers_for_group(group);
        let mut by_access: HashMap<String, HashSet<Arc<Peer>>> = HashMap::new();
        for peer in &all_peers {
            for access_id in peer.access_ids() {
                by_access.entry(access_id).or_default().insert(peer.clone());
            }
        }

        let mut order: Vec<String> = by_access.keys().cloned().collect();
        order.sort_by_key(|access_id| std::cmp::Reverse(by_access[access_id].len()));

        let mut remaining = by_access;
        for access_id in order {
            let access_peers = match remaining.get(&access_id) {
                Some(peers) if !peers.is_empty() => peers.clone(),
                _ => continue,
            };
            let Some(transport) = self.0.multiplex.get(&access_id) else {
                continue;
            };
            match transport.fire_group(group, &access_peers, message) {
                Ok(covered) => {
                    for peers in remaining.values_mut() {
                        for peer in &covered {
                            peers.remove(peer);
                        }
                    }
                    if remaining.values().all(HashSet::is_empty) {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%access_id, %err, "transport could not fan out to group");
                }
            }
        }

        let unreached: HashSet<Arc<Peer>> = remaining.into_values().flatten().collect();
        Ok((message.uid.clone(), unreached))
    }

    /// Fires `message` at every peer in `group`, returning peers it
    /// couldn't reach with any bound transport (§4.3).
    pub fn fire_group(
        &self,
        group: &str,
        message: &Message,
    ) -> Result<(String, HashSet<Arc<Peer>>), HeraldError> {
        if let Some(err) = self.rejects_while_shutting_down() {
            return Err(err);
        }
        self.fire_group_coverage(group, message)
    }

    /// Sends `message` and awaits its reply, up to `timeout`.
    pub async fn send(
        &self,
        target: impl Into<Target>,
        message: Message,
        timeout: Duration,
    ) -> Result<MessageReceived, HeraldError> {
        if let Some(err) = self.rejects_while_shutting_down() {
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        let uid = message.uid.clone();
        self.0.sync_waiters.lock().insert(uid.clone(), tx);

        if let Err(err) = self.fire(target, &message) {
            self.0.sync_waiters.lock().remove(&uid);
            return Err(err);
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.0.sync_waiters.lock().remove(&uid);

        match outcome {
            Ok(Ok(SyncOutcome::Reply(received))) => Ok(*received),
            Ok(Ok(SyncOutcome::Error(err))) => Err(err),
            Ok(Ok(SyncOutcome::Shutdown)) | Ok(Err(_)) => Err(HeraldError::HeraldTimeout(
                "Herald stops listening to messages".to_string(),
            )),
            Err(_elapsed) => Err(HeraldError::HeraldTimeout(
                "Timeout reached before receiving a reply".to_string(),
            )),
        }
    }

    /// Posts `message`, invoking `callback`/`errback` from the worker pool
    /// as replies/failures arrive. `None` timeout means "never expire"
    /// (the caller is then responsible for calling [`HeraldHandle::forget`]).
    pub fn post(
        &self,
        target: impl Into<Target>,
        message: Message,
        callback: impl Fn(&HeraldHandle, &MessageReceived) + Send + Sync + 'static,
        errback: impl Fn(&HeraldHandle, &HeraldError) + Send + Sync + 'static,
        timeout: Option<Duration>,
        forget_on_first: bool,
    ) -> Result<String, HeraldError> {
        if let Some(err) = self.rejects_while_shutting_down() {
            return Err(err);
        }

        let uid = message.uid.clone();
        let waiting = WaitingPost {
            callback: Arc::new(callback),
            errback: Arc::new(errback),
            deadline: timeout.map(|d| Instant::now() + d),
            forget_on_first,
        };
        self.0.post_waiters.lock().insert(uid.clone(), waiting);

        match self.fire(target, &message) {
            Ok(uid) => Ok(uid),
            Err(err) => {
                self.0.post_waiters.lock().remove(&uid);
                Err(err)
            }
        }
    }

    /// Posts `message` to every peer in `group`. Never forgets after the
    /// first reply, since multiple peers may answer (§4.3).
    pub fn post_group(
        &self,
        group: &str,
        message: Message,
        callback: impl Fn(&HeraldHandle, &MessageReceived) + Send + Sync + 'static,
        errback: impl Fn(&HeraldHandle, &HeraldError) + Send + Sync + 'static,
        timeout: Option<Duration>,
    ) -> Result<String, HeraldError> {
        if let Some(err) = self.rejects_while_shutting_down() {
            return Err(err);
        }

        let uid = message.uid.clone();
        let waiting = WaitingPost {
            callback: Arc::new(callback),
            errback: Arc::new(errback),
            deadline: timeout.map(|d| Instant::now() + d),
            forget_on_first: false,
        };
        self.0.post_waiters.lock().insert(uid.clone(), waiting);

        match self.fire_group_coverage(group, &message) {
            Ok((uid, _unreached)) => Ok(uid),
            Err(err) => {
                self.0.post_waiters.lock().remove(&uid);
                Err(err)
            }
        }
    }

    /// Removes any waiter for `uid`, resolving it with [`HeraldError::ForgotMessage`].
    /// Returns whether anything was actually waiting.
    pub fn forget(&self, uid: &str) -> bool {
        let mut found = false;

        if let Some(tx) = self.0.sync_waiters.lock().remove(uid) {
            let _ = tx.send(SyncOutcome::Error(HeraldError::ForgotMessage(uid.to_string())));
            found = true;
        }

        if let Some(waiting) = self.0.post_waiters.lock().remove(uid) {
            let handle = self.clone();
            let err = HeraldError::ForgotMessage(uid.to_string());
            call_safely("post errback (forget)", || (waiting.errback)(&handle, &err));
            found = true;
        }

        found
    }

    /// Replies to `original`, preferring the transport and connection it
    /// arrived on before falling back to an ordinary `fire`.
    pub fn reply(
        &self,
        original: &MessageReceived,
        content: Option<Value>,
        subject: Option<&str>,
    ) -> Result<String, HeraldError> {
        let subject = subject.unwrap_or(&original.subject);
        let message = Message::new(subject.to_string(), content);

        if let Some(transport) = self.0.multiplex.get(&original.access) {
            let peer = self.0.directory.get_peer(&original.sender).ok();
            if transport
                .fire(peer.as_ref(), &message, Some(&original.extra))
                .is_ok()
            {
                return Ok(message.uid.clone());
            }
        }

        match self.fire(original.sender.as_str(), &message) {
            Ok(uid) => Ok(uid),
            Err(HeraldError::UnknownPeer(_)) => Err(HeraldError::NoTransport(format!(
                "no access to reply to {}",
                original.sender
            ))),
            Err(other) => Err(other),
        }
    }

    /// Entry point from transports: routes internal subjects to their
    /// handler, otherwise runs the notify pipeline (§4.3, §4.3.1, §4.3.2).
    pub fn handle_message(&self, received: MessageReceived) {
        let parts = received.subject_parts();
        if parts.first() == Some(&"herald") {
            match parts.get(1).copied() {
                Some("error") => {
                    if let Some(kind) = parts.get(2) {
                        self.handle_error(&received, kind);
                    }
                    return;
                }
                Some("directory") => {
                    if let Some(kind) = parts.get(2) {
                        self.handle_directory_message(&received, kind);
                    }
                    return;
                }
                _ => {}
            }
        }
        self.notify(received);
    }

    fn handle_error(&self, received: &MessageReceived, kind: &str) {
        if kind != "no-listener" {
            return;
        }
        let Some(content) = &received.content else {
            return;
        };
        let (Some(uid), Some(subject)) = (
            content.get("uid").and_then(Value::as_str),
            content.get("subject").and_then(Value::as_str),
        ) else {
            return;
        };

        let err = HeraldError::NoListener {
            uid: uid.to_string(),
            subject: subject.to_string(),
        };

        if let Some(tx) = self.0.sync_waiters.lock().remove(uid) {
            let _ = tx.send(SyncOutcome::Error(err.clone()));
        }
        if let Some(waiting) = self.0.post_waiters.lock().remove(uid) {
            let handle = self.clone();
            call_safely("post errback (no-listener)", || {
                (waiting.errback)(&handle, &err)
            });
        }
    }

    fn handle_directory_message(&self, received: &MessageReceived, kind: &str) {
        let Some(content) = &received.content else {
            warn!(kind, "directory message with no content, ignoring");
            return;
        };
        let dump: PeerDump = match serde_json::from_value(content.clone()) {
            Ok(dump) => dump,
            Err(err) => {
                warn!(kind, %err, "malformed peer dump, ignoring");
                return;
            }
        };

        match kind {
            "newcomer" => {
                if self.0.directory.register(&dump).is_ok() {
                    let welcome = self.local_peer().dump();
                    let _ = self.reply(
                        received,
                        Some(serde_json::to_value(welcome).unwrap_or(Value::Null)),
                        Some("herald/directory/welcome"),
                    );
                }
            }
            "welcome" => {
                let _ = self.0.directory.register(&dump);
            }
            "bye" => {
                self.0.directory.unregister(&dump);
            }
            _ => {}
        }
    }

    fn notify(&self, received: MessageReceived) {
        if let Some(reply_to) = received.reply_to.clone() {
            if let Some(tx) = self.0.sync_waiters.lock().remove(&reply_to) {
                let _ = tx.send(SyncOutcome::Reply(Box::new(received.clone())));
            }

            let callback = {
                let mut waiters = self.0.post_waiters.lock();
                match waiters.get(&reply_to) {
                    Some(waiting) => {
                        let callback = waiting.callback.clone();
                        if waiting.forget_on_first {
                            waiters.remove(&reply_to);
                        }
                        Some(callback)
                    }
                    None => None,
                }
            };

            if let Some(callback) = callback {
                let handle = self.clone();
                let received = received.clone();
                self.enqueue(Box::new(move || {
                    call_safely("post callback", || callback(&handle, &received));
                }));
            }
        }

        let matched = self.0.listeners.matches(&received.subject);
        if matched.is_empty() {
            if !is_internal_subject(&received.subject) {
                let _ = self.reply(
                    &received,
                    Some(json!({"uid": received.uid, "subject": received.subject})),
                    Some("herald/error/no-listener"),
                );
            }
            return;
        }

        for listener in matched {
            let handle = self.clone();
            let received = received.clone();
            self.enqueue(Box::new(move || {
                call_safely("listener", || listener.herald_message(&handle, &received));
            }));
        }
    }

    fn enqueue(&self, job: Job) {
        if let Some(pool) = self.0.pool.lock().as_ref() {
            pool.enqueue(job);
        }
    }

    /// Shuts the engine down: stops GC, resolves every waiter, stops the
    /// worker pool and drops every bound transport (§5).
    pub async fn shutdown(&self) {
        self.0.active.store(false, Ordering::SeqCst);

        if let Some(gc) = self.0.gc_handle.lock().take() {
            gc.abort();
        }

        let sync_waiters: Vec<_> = self.0.sync_waiters.lock().drain().collect();
        for (_, tx) in sync_waiters {
            let _ = tx.send(SyncOutcome::Shutdown);
        }

        let shutdown_err =
            HeraldError::HeraldTimeout("Herald stops listening to messages".to_string());
        let post_waiters: Vec<_> = self.0.post_waiters.lock().drain().map(|(_, w)| w).collect();
        for waiting in post_waiters {
            let handle = self.clone();
            call_safely("post errback (shutdown)", || {
                (waiting.errback)(&handle, &shutdown_err)
            });
        }

        if let Some(pool) = self.0.pool.lock().take() {
            pool.stop();
        }

        self.0.multiplex.clear();
    }
}

impl Inner {
    /// Removes async-waiters whose deadline has passed. Runs every 30s
    /// from a background task; no callback fires for a GC'd entry (§4.3.3).
    fn garbage_collect(inner: &Arc<Inner>) {
        let now = Instant::now();
        let mut waiters = inner.post_waiters.lock();
        waiters.retain(|_, waiting| match waiting.deadline {
            Some(deadline) => now < deadline,
            None => true,
        });
    }
}
