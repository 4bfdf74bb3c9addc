//! Error types for echo-relay.
//!
//! Connection-level failures never escape their connection: they are logged
//! and the connection closes. These types surface to process callers
//! (server lifecycle, client, configuration) and to the codec.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for echo-relay operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server lifecycle must be driven from outside an async runtime")]
    InsideRuntime,

    #[error("client is not connected")]
    NotConnected,
}

impl Error {
    /// True when the error means the peer went away at a message boundary
    /// or mid-message, rather than a local failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Framing violations. Any of these desynchronizes the stream, so the
/// offending connection is closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("body of {size} bytes exceeds limit of {max} bytes")]
    BodyTooLarge { size: u64, max: u64 },
}
