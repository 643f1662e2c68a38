//! Error taxonomy surfaced to Herald callers.

use std::fmt;

/// Errors that can escape the public `HeraldHandle` API.
///
/// This is the complete taxonomy from the engine's point of view; transports
/// report their own errors through [`HeraldError::Transport`] when they don't
/// fit one of the named variants.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HeraldError {
    /// No peer is registered under the given UID.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// No transport could deliver the message, either because none is bound
    /// or because every access a peer advertised was rejected.
    #[error("no transport: {0}")]
    NoTransport(String),

    /// A transport rejected a peer's access descriptor. Internal to the
    /// engine: it drives fallback between a peer's accesses and never
    /// escapes `fire`/`send`/`post`.
    #[error("invalid peer access: {0}")]
    InvalidPeerAccess(String),

    /// The remote peer replied that nobody was listening for the subject.
    #[error("no listener for {subject} (message {uid})")]
    NoListener {
        /// UID of the message that went unanswered.
        uid: String,
        /// Subject nobody subscribed to.
        subject: String,
    },

    /// A `send()` deadline elapsed, or the engine shut down while waiting.
    #[error("herald timeout: {0}")]
    HeraldTimeout(String),

    /// `forget(uid)` was called on a pending waiter.
    #[error("message forgotten: {0}")]
    ForgotMessage(String),

    /// Catch-all for a transport-specific failure that isn't
    /// `InvalidPeerAccess` (e.g. a broker write failure).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors a [`crate::transport::Transport`] implementation can report from
/// `fire`/`fire_group`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The peer has no usable descriptor for this transport's access id.
    #[error("invalid peer access: {0}")]
    InvalidPeerAccess(String),

    /// Any other transport-level failure (broker unreachable, encode error, ...).
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn other(msg: impl fmt::Display) -> Self {
        TransportError::Other(msg.to_string())
    }
}

pub type HeraldResult<T> = Result<T, HeraldError>;
