//! echo-relay: a message-oriented TCP echo service
//!
//! Clients send typed, length-prefixed messages; the server frames them,
//! routes each through an application handler and writes the response back
//! over the same connection.
//!
//! ```text
//! socket ─► Connection read task ─► inbound TsQueue ─► dispatch thread
//!                                                           │ Handler
//! socket ◄─ Connection write chain ◄─ outbound TsQueue ◄────┘
//! ```
//!
//! Features:
//! - Fixed 12-byte big-endian header, bounded body size
//! - One read task and at most one write chain per connection
//! - Shared blocking inbound queue decoupling I/O from processing
//! - Periodic reaping of closed connections
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use client::Client;
pub use config::Config;
pub use error::{Error, ProtocolError, Result};
pub use handler::{EchoHandler, Handler};
pub use protocol::{Message, MessageKind};
pub use server::Server;

/// Current version of echo-relay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
