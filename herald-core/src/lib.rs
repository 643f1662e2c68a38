//! Transport-agnostic peer-to-peer messaging engine.
//!
//! `herald-core` owns the peer directory, subject-filter listener registry,
//! worker pool and request/reply correlation state. It knows nothing about
//! any particular wire protocol; a [`transport::Transport`] implementation
//! (see `herald-mqtt`) is what actually puts bytes on a network.

pub mod config;
pub mod directory;
pub mod error;
pub mod handle;
pub mod listeners;
pub mod message;
pub mod peer;
pub mod transport;
pub mod workers;

pub use config::HeraldConfig;
pub use error::{HeraldError, HeraldResult, TransportError};
pub use handle::{HeraldHandle, Target};
pub use listeners::{ListenerId, MessageListener};
pub use message::{Envelope, Message, MessageReceived};
pub use peer::{AccessDescriptor, DirectorySink, Peer, PeerDump};
pub use transport::{Extra, Multiplex, Transport};
