//! Session message codec.
//!
//! A [`Message`] travels as one JSON object, `{"code":<u8>,"payload":<value>}`.
//! JSON objects are self-delimiting, so the stream needs no length prefix: the
//! decoder consumes exactly one complete object from the front of the buffer
//! and waits for more bytes when the object is still open.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::types::MessageCode;

/// Default upper bound for a single encoded message.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Unit of transfer on a session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    code: MessageCode,
    #[serde(default)]
    payload: Value,
}

impl Message {
    /// Build a data message from any serializable payload.
    pub fn data<T: Serialize + ?Sized>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            code: MessageCode::Data,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Build the notice a side sends before it closes the connection.
    pub fn disconnect_notice() -> Self {
        Self {
            code: MessageCode::DisconnectNotice,
            payload: Value::Null,
        }
    }

    /// Message code.
    pub fn code(&self) -> MessageCode {
        self.code
    }

    /// Raw payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consume the message, returning its payload.
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// `tokio_util` codec for [`Message`] streams.
///
/// The decoder tracks how far it has scanned into the open object, so each
/// byte is examined once however the message is chunked.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_len: usize,
    scan: Scan,
}

/// Progress through the object at the front of the buffer.
#[derive(Debug, Clone, Copy, Default)]
struct Scan {
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Advance over `bytes`, returning the index just past the closing brace
    /// of the top-level object, relative to `bytes`.
    fn feed(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl MessageCodec {
    /// Create a codec with a custom per-message limit.
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            scan: Scan::default(),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.scan.offset == 0 {
            match src.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(skip) => src.advance(skip),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }
            if src[0] != b'{' {
                return Err(CodecError::UnexpectedByte(src[0]));
            }
        }

        let start = self.scan.offset;
        match self.scan.feed(&src[start..]) {
            Some(len) => {
                let object = src.split_to(start + len);
                self.scan = Scan::default();
                if object.len() > self.max_len {
                    return Err(CodecError::MessageTooLarge { max: self.max_len });
                }
                Ok(Some(serde_json::from_slice(&object)?))
            }
            None => {
                self.scan.offset = src.len();
                if src.len() > self.max_len {
                    Err(CodecError::MessageTooLarge { max: self.max_len })
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        serde_json::to_writer((&mut *dst).writer(), &item)?;
        if dst.len() - start > self.max_len {
            dst.truncate(start);
            return Err(CodecError::MessageTooLarge { max: self.max_len });
        }
        Ok(())
    }
}
