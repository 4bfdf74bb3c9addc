//! Message definitions.
//!
//! A message is a kind tag plus an opaque body. The wire `size` is never
//! stored separately; it is derived from the body whenever a header is
//! produced, so it cannot drift from the body length.

use bytes::{BufMut, BytesMut};

use super::codec::HEADER_LEN;
use crate::error::ProtocolError;

/// Application semantics selected by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Respond with the body unchanged.
    InOrder = 0,
    /// Respond with the body's bytes reversed.
    Reverse = 1,
}

impl MessageKind {
    /// Decode from the raw header value.
    pub fn from_u32(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(MessageKind::InOrder),
            1 => Ok(MessageKind::Reverse),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Fixed-size header preceding every body on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    /// Number of body bytes that follow the header.
    pub size: u64,
}

impl MessageHeader {
    /// Serialize as `kind (u32 BE) | size (u64 BE)`.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.kind.as_u32().to_be_bytes());
        out[4..].copy_from_slice(&self.size.to_be_bytes());
        out
    }
}

/// A typed, length-prefixed unit of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    body: BytesMut,
}

impl Message {
    /// Create an empty message of the given kind.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            body: BytesMut::new(),
        }
    }

    /// Create a message with an initial body.
    pub fn with_body(kind: MessageKind, body: impl AsRef<[u8]>) -> Self {
        Self {
            kind,
            body: BytesMut::from(body.as_ref()),
        }
    }

    pub(crate) fn from_parts(kind: MessageKind, body: BytesMut) -> Self {
        Self { kind, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Change the kind, keeping the body.
    pub fn set_kind(&mut self, kind: MessageKind) {
        self.kind = kind;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body length in bytes; this is the header's `size`.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Header describing the current body.
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            kind: self.kind,
            size: self.body.len() as u64,
        }
    }

    /// Append text to the body.
    pub fn push_str(&mut self, text: &str) -> &mut Self {
        self.body.extend_from_slice(text.as_bytes());
        self
    }

    /// Append raw bytes to the body.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.body.extend_from_slice(bytes);
        self
    }

    /// Drain the body as text, leaving the message empty.
    ///
    /// Invalid UTF-8 sequences are replaced rather than rejected.
    pub fn take_string(&mut self) -> String {
        let body = self.body.split();
        String::from_utf8_lossy(&body).into_owned()
    }

    /// Reverse the body bytes in place.
    pub fn reverse_body(&mut self) {
        self.body.reverse();
    }

    /// Empty the body, keeping the kind.
    pub fn clear(&mut self) {
        self.body.clear();
    }

    /// Serialize header and body into a single buffer.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        out.put_slice(&self.header().to_bytes());
        out.put_slice(&self.body);
        out
    }
}
