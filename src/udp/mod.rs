//! UDP side: framed datagram channel and the peer negotiator built on it.

mod channel;
mod negotiator;

pub use channel::{Datagram, DatagramListener, FramedChannel};
pub use negotiator::{PeerNegotiator, PeerStatusListener};
