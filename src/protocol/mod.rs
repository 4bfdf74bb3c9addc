//! Wire protocol.
//!
//! Every message is a fixed 12-byte header followed by the body:
//!
//! ```text
//! Request:  <kind u32 BE><size u64 BE><size bytes>
//! Response: <kind u32 BE><size u64 BE><size bytes>
//!
//! Example (Reverse, "hello"):
//! Request:  00000001 0000000000000005 "hello"
//! Response: 00000001 0000000000000005 "olleh"
//! ```
//!
//! Kinds:
//! - `0` InOrder: respond with the body unchanged
//! - `1` Reverse: respond with the body's bytes reversed
//!
//! A client may pipeline several requests before reading responses; each
//! request produces exactly one response, in order, on the same connection.

pub mod codec;
mod message;

pub use codec::{
    decode_header, parse, read_body, read_header, read_message, read_message_blocking,
    write_message_blocking, ParseResult, DEFAULT_MAX_BODY_SIZE, HEADER_LEN,
};
pub use message::{Message, MessageHeader, MessageKind};
