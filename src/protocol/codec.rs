//! Wire codec.
//!
//! ## Wire Format
//!
//! ```text
//! ┌────────────┬────────────────┬──────────────────────────┐
//! │ Kind (4)   │ Size (8)       │ Body (Size bytes)        │
//! └────────────┴────────────────┴──────────────────────────┘
//! ```
//!
//! Both header fields are big-endian. No padding, no checksum.
//!
//! Readers consume the header first, validate `size` against the configured
//! limit, then read exactly `size` body bytes. Short reads are not errors;
//! the readers keep requesting bytes until the exact counts are satisfied.

use bytes::BytesMut;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Message, MessageHeader, MessageKind};
use crate::error::{ProtocolError, Result};

/// Header size: 4 byte kind + 8 byte size
pub const HEADER_LEN: usize = 12;

/// Default maximum body size (16 MB)
pub const DEFAULT_MAX_BODY_SIZE: u64 = 16 * 1024 * 1024;

/// Parse result for buffer-based decoding.
#[derive(Debug)]
pub enum ParseResult {
    /// A full message and the number of bytes it occupied.
    Complete(Message, usize),
    /// Need more data.
    Incomplete,
    /// The header is invalid; the stream cannot be resynchronized.
    Error(ProtocolError),
}

/// Decode and validate a header.
pub fn decode_header(
    bytes: &[u8; HEADER_LEN],
    max_body_size: u64,
) -> std::result::Result<MessageHeader, ProtocolError> {
    let kind = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&bytes[4..]);
    let size = u64::from_be_bytes(size_bytes);

    let kind = MessageKind::from_u32(kind)?;

    // Bodies are buffered whole, so the limit never exceeds addressable memory
    let max = max_body_size.min(usize::MAX as u64);
    if size > max {
        return Err(ProtocolError::BodyTooLarge { size, max });
    }

    Ok(MessageHeader { kind, size })
}

/// Parse one message from the front of `input`.
pub fn parse(input: &[u8], max_body_size: u64) -> ParseResult {
    let Some(header_bytes) = input.first_chunk::<HEADER_LEN>() else {
        return ParseResult::Incomplete;
    };

    let header = match decode_header(header_bytes, max_body_size) {
        Ok(header) => header,
        Err(e) => return ParseResult::Error(e),
    };

    // decode_header bounds size to usize
    let total = HEADER_LEN + header.size as usize;
    if input.len() < total {
        return ParseResult::Incomplete;
    }

    let body = BytesMut::from(&input[HEADER_LEN..total]);
    ParseResult::Complete(Message::from_parts(header.kind, body), total)
}

// =============================================================================
// Async stream helpers
// =============================================================================

/// Read and validate a header from an async stream.
pub async fn read_header<R>(reader: &mut R, max_body_size: u64) -> Result<MessageHeader>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    Ok(decode_header(&header, max_body_size)?)
}

/// Read exactly `header.size` body bytes from an async stream.
pub async fn read_body<R>(reader: &mut R, header: MessageHeader) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut body = BytesMut::zeroed(header.size as usize);
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }
    Ok(Message::from_parts(header.kind, body))
}

/// Read a complete message from an async stream.
pub async fn read_message<R>(reader: &mut R, max_body_size: u64) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader, max_body_size).await?;
    read_body(reader, header).await
}

// =============================================================================
// Blocking stream helpers
// =============================================================================

/// Read a complete message from a blocking stream.
pub fn read_message_blocking<R: Read>(reader: &mut R, max_body_size: u64) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let header = decode_header(&header, max_body_size)?;

    let mut body = BytesMut::zeroed(header.size as usize);
    if !body.is_empty() {
        reader.read_exact(&mut body)?;
    }
    Ok(Message::from_parts(header.kind, body))
}

/// Write a message to a blocking stream.
pub fn write_message_blocking<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.header().to_bytes())?;
    writer.write_all(message.body())?;
    writer.flush()?;
    Ok(())
}
