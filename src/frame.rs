//! Datagram frame wire format.
//!
//! Every datagram on a [`FramedChannel`](crate::udp::FramedChannel) is:
//!
//! - TYPE_ID (4B BE): listener routing key
//! - LENGTH (4B BE): payload length, at most the channel's max payload
//! - PAYLOAD: `LENGTH` raw bytes
//!
//! Bytes after the payload are ignored.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::types::FRAME_HEADER_LEN;

/// A decoded datagram frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramFrame {
    /// Routing key for listener fan-out.
    pub type_id: u32,
    /// Frame body.
    pub payload: Bytes,
}

impl DatagramFrame {
    /// Create a frame.
    pub fn new(type_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }

    /// Total size on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}

/// Encode a frame, refusing payloads larger than `max_payload`.
pub fn encode_frame(type_id: u32, payload: &[u8], max_payload: usize) -> Result<Bytes, FrameError> {
    if payload.len() > max_payload {
        return Err(FrameError::Oversized {
            declared: payload.len(),
            max: max_payload,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(type_id);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode one datagram into a frame.
pub fn decode_frame(datagram: &[u8], max_payload: usize) -> Result<DatagramFrame, FrameError> {
    if datagram.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated(datagram.len()));
    }

    let type_id = BigEndian::read_u32(&datagram[0..4]);
    let declared = BigEndian::read_u32(&datagram[4..8]) as usize;
    if declared > max_payload {
        return Err(FrameError::Oversized {
            declared,
            max: max_payload,
        });
    }

    let body = &datagram[FRAME_HEADER_LEN..];
    if declared > body.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            available: body.len(),
        });
    }

    Ok(DatagramFrame {
        type_id,
        payload: Bytes::copy_from_slice(&body[..declared]),
    })
}

/// Encode a negotiation description as a control payload.
pub fn encode_description(description: u64) -> [u8; 8] {
    let mut out = [0u8; 8];
    BigEndian::write_u64(&mut out, description);
    out
}

/// Decode a control payload. Anything but exactly 8 bytes is rejected.
pub fn decode_description(payload: &[u8]) -> Option<u64> {
    (payload.len() == crate::types::DESCRIPTION_LEN).then(|| BigEndian::read_u64(payload))
}
