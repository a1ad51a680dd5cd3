//! Shared protocol constants and state types.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Size of the datagram frame header: `type_id` (4B BE) + `length` (4B BE).
pub const FRAME_HEADER_LEN: usize = 8;

/// Default maximum payload carried by one datagram frame.
pub const MAX_PAYLOAD: usize = 1024;

/// Type id used when an application does not pick one.
pub const DEFAULT_TYPE_ID: u32 = 0x0;

/// Control datagram: "I am trying to reach you".
pub const CONTACT_REQUEST: u32 = 1;
/// Control datagram: "I have heard from you".
pub const CONTACT_RESPONSE: u32 = 2;
/// Control datagram: liveness probe once connected.
pub const KEEP_ALIVE: u32 = 3;
/// Control datagram: reply to [`KEEP_ALIVE`].
pub const KEEP_ALIVE_ACK: u32 = 4;

/// Type ids owned by the peer negotiator.
pub const CONTROL_TYPE_IDS: [u32; 4] = [CONTACT_REQUEST, CONTACT_RESPONSE, KEEP_ALIVE, KEEP_ALIVE_ACK];

/// Length of a control datagram payload (one big-endian `u64` description).
pub const DESCRIPTION_LEN: usize = 8;

/// Returns true if `type_id` is reserved for negotiation traffic.
pub fn is_control_type(type_id: u32) -> bool {
    CONTROL_TYPE_IDS.contains(&type_id)
}

/// A remote endpoint the negotiator is punching towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Address and port the peer was registered with.
    pub addr: SocketAddr,
    /// Random value identifying this side of the negotiation to the peer.
    pub local_description: u64,
    /// The peer's own description, learned from its first control datagram.
    pub remote_description: Option<u64>,
}

impl Peer {
    /// Create a peer record with no remote description yet.
    pub fn new(addr: SocketAddr, local_description: u64) -> Self {
        Self {
            addr,
            local_description,
            remote_description: None,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:016x}]", self.addr, self.local_description)
    }
}

/// Phase of a per-peer negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationPhase {
    /// Sending contact requests and responses until the peer is heard.
    Request,
    /// Peer's request arrived; answering with responses only.
    RequestResponse,
    /// Connected; probing liveness.
    KeepAlive,
    /// Worker finished. Terminal.
    Stopped,
}

impl NegotiationPhase {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::RequestResponse => "request-response",
            Self::KeepAlive => "keep-alive",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connectivity of a negotiated peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Negotiation in progress.
    AwaitingConnection,
    /// Two-way reachability confirmed.
    Connected,
    /// An attempt cap was exceeded before reachability was confirmed.
    ConnectionError,
    /// Keep-alives went unanswered, or the peer was removed while connected.
    Disconnected,
}

/// Lifecycle of a message session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Created but never connected.
    AwaitingConnect,
    /// Workers running; messages flow.
    Connected,
    /// Tear-down in progress.
    Disconnecting,
    /// Socket closed.
    Disconnected,
}

/// Why a session left the `Connected` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// This side called `disconnect`.
    Local,
    /// The peer sent a disconnect notice.
    Remote,
    /// The connection failed without either side asking.
    Failure,
}

/// Session message code, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageCode {
    /// Application payload.
    Data = 0x0,
    /// Sender is disconnecting; the receiver should disconnect too.
    DisconnectNotice = 0x1,
}

impl From<MessageCode> for u8 {
    fn from(code: MessageCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = crate::error::CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Data),
            0x1 => Ok(Self::DisconnectNotice),
            other => Err(crate::error::CodecError::UnknownCode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_types_reserved() {
        for id in 1..=4 {
            assert!(is_control_type(id));
        }
        assert!(!is_control_type(DEFAULT_TYPE_ID));
        assert!(!is_control_type(5));
    }

    #[test]
    fn test_message_code_from_byte() {
        assert_eq!(MessageCode::try_from(0).unwrap(), MessageCode::Data);
        assert_eq!(MessageCode::try_from(1).unwrap(), MessageCode::DisconnectNotice);
        assert!(MessageCode::try_from(7).is_err());
    }
}
