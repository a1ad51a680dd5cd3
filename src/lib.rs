//! # natlink
//!
//! Peer-to-peer transport plumbing:
//!
//! * **Framed datagram channel**: type-tagged, size-bounded UDP datagrams
//!   with per-type listener fan-out
//! * **Peer negotiator**: UDP hole punching with keep-alive liveness, driven
//!   over the channel
//! * **Message sessions**: ordered, listener-delivered messages over TCP with
//!   a bilateral disconnect handshake and bounded reconnect
//! * **Session acceptor**: accepts TCP connections and gates them through
//!   connect listeners
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use natlink::{ChannelConfig, FramedChannel, NegotiatorConfig, PeerNegotiator};
//!
//! # async fn run() {
//! let channel = FramedChannel::new(ChannelConfig::with_port(40000));
//! assert!(channel.start().await);
//!
//! let negotiator = PeerNegotiator::new(channel.clone(), NegotiatorConfig::default());
//! let peer = "203.0.113.7:40000".parse().unwrap();
//! if negotiator.add_peer(peer, true, None).await {
//!     negotiator.send_to_peer(peer, 10, b"hello").await;
//! }
//! # }
//! ```
//!
//! ## Wire Formats
//!
//! Datagram frames:
//!
//! - TYPE_ID (4B BE): listener routing key
//! - LENGTH (4B BE): payload length, at most 1024 by default
//! - PAYLOAD: raw bytes
//!
//! Negotiation control datagrams are frames whose payload is the sender's
//! 8-byte big-endian description:
//!
//! | Type | Name             | Meaning                          |
//! |------|------------------|----------------------------------|
//! | 1    | CONTACT_REQUEST  | Sender is trying to reach you    |
//! | 2    | CONTACT_RESPONSE | Sender has heard from you        |
//! | 3    | KEEP_ALIVE       | Liveness probe                   |
//! | 4    | KEEP_ALIVE_ACK   | Reply to a probe                 |
//!
//! Session messages are JSON objects `{"code": u8, "payload": value}` with
//! `code` 0 for data and 1 for a disconnect notice.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod listener;
pub mod tcp;
pub mod types;
pub mod udp;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Re-export main types for convenience
pub use codec::{Message, MessageCodec};
pub use config::{
    AcceptorConfig, ChannelConfig, NegotiatorConfig, PhaseTiming, SessionConfig, TransportConfig,
};
pub use error::{CodecError, ConfigError, FrameError, SessionError};
pub use frame::{decode_frame, encode_frame, DatagramFrame};
pub use listener::{ListenerId, ListenerSet};
pub use tcp::{ConnectListener, MessageListener, Reconnecting, Session, SessionAcceptor};
pub use types::{
    DisconnectReason, MessageCode, NegotiationPhase, Peer, PeerStatus, SessionStatus,
    CONTACT_REQUEST, CONTACT_RESPONSE, DEFAULT_TYPE_ID, KEEP_ALIVE, KEEP_ALIVE_ACK, MAX_PAYLOAD,
};
pub use udp::{Datagram, DatagramListener, FramedChannel, PeerNegotiator, PeerStatusListener};

/// Lock a mutex, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
