//! Blocking client for the relay protocol.
//!
//! One persistent stream per client. Each `send` writes a full frame and
//! each `receive` reads exactly one full frame, however the bytes arrive.

use std::net::{Shutdown, TcpStream};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{
    read_message_blocking, write_message_blocking, Message, DEFAULT_MAX_BODY_SIZE,
};

/// Synchronous relay client.
pub struct Client {
    stream: Option<TcpStream>,
    max_body_size: u64,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            stream: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Set the largest response body this client will accept.
    pub fn with_max_body_size(mut self, max_body_size: u64) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Connect to `host:port`, replacing any existing connection.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        debug!(host, port, "Connected");
        self.stream = Some(stream);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Write one request frame.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let result = write_message_blocking(stream, message);
        self.on_result(result)
    }

    /// Block until one full response frame arrives.
    pub fn receive(&mut self) -> Result<Message> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let result = read_message_blocking(stream, self.max_body_size);
        self.on_result(result)
    }

    /// Send a request and wait for its response.
    pub fn request(&mut self, message: &Message) -> Result<Message> {
        self.send(message)?;
        self.receive()
    }

    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Any failure leaves the stream in an unknown framing position, so the
    /// client drops it.
    fn on_result<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}
