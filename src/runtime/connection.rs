//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its socket and runs two independent pipelines:
//!
//! - A read task that frames messages (`AwaitingHeader -> AwaitingBody ->
//!   Dispatching`, then back to `AwaitingHeader`) and pushes them, tagged
//!   with the connection, onto the server's shared inbound queue.
//! - A write chain that drains the private outbound queue onto the wire.
//!   At most one chain runs per connection, so frames never interleave.
//!
//! Any I/O or framing error moves the connection to `Closed`, which is
//! terminal: the read task is cancelled and nothing more is written.

use parking_lot::Mutex;
use slab::Slab;
use socket2::{SockRef, Socket};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::protocol::{read_body, read_header, Message, MessageHeader};
use crate::runtime::TsQueue;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket open; pipelines may be scheduled.
    Active,
    /// Terminal. No further reads or writes are scheduled.
    Closed,
}

/// Read pipeline step.
#[derive(Debug)]
enum ReadState {
    AwaitingHeader,
    AwaitingBody(MessageHeader),
    Dispatching(Message),
}

/// Write chain step for the message at the front of the outbound queue.
#[derive(Debug, Clone, Copy)]
enum WriteState {
    WritingHeader,
    WritingBody,
}

/// A framed message together with the connection it arrived on.
pub struct TaggedMessage {
    pub origin: Arc<Connection>,
    pub message: Message,
}

/// A single client connection.
pub struct Connection {
    /// Slot in the connection registry.
    id: usize,
    peer: SocketAddr,
    state: Mutex<ConnState>,
    /// Server-wide mailbox this connection produces into.
    inbound: Arc<TsQueue<TaggedMessage>>,
    /// Responses waiting for the write chain.
    outbound: TsQueue<Message>,
    /// Read half, taken by the read task when it starts.
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Duplicate handle used to shut the socket down from `close`.
    socket: Socket,
    /// True while a write chain is scheduled.
    write_in_flight: AtomicBool,
    shutdown: watch::Sender<bool>,
    max_body_size: u64,
    runtime: Handle,
}

impl Connection {
    /// Wrap an accepted stream. The read pipeline starts with [`start`](Self::start).
    pub fn new(
        id: usize,
        stream: TcpStream,
        inbound: Arc<TsQueue<TaggedMessage>>,
        max_body_size: u64,
        runtime: Handle,
    ) -> Result<Arc<Self>> {
        let peer = stream.peer_addr()?;

        // Disable Nagle's algorithm; responses are small and latency-bound
        stream.set_nodelay(true)?;
        let socket = SockRef::from(&stream).try_clone()?;

        let (reader, writer) = stream.into_split();
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            id,
            peer,
            state: Mutex::new(ConnState::Active),
            inbound,
            outbound: TsQueue::new(),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            socket,
            write_in_flight: AtomicBool::new(false),
            shutdown,
            max_body_size,
            runtime,
        }))
    }

    /// Registry slot of this connection.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    /// Check if the connection has reached `Closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Number of responses not yet picked up by the write chain.
    ///
    /// A frame the chain is currently writing is not counted.
    pub fn pending_writes(&self) -> usize {
        self.outbound.len()
    }

    /// Arm the read pipeline. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(reader) = self.reader.lock().take() else {
            return;
        };
        let conn = Arc::clone(self);
        self.runtime.spawn(conn.read_loop(reader));
    }

    /// Move to `Closed`. Idempotent.
    ///
    /// Once this returns, the read task pushes nothing more to the inbound
    /// queue, queued responses are discarded and the socket is shut down in
    /// both directions, so the peer sees EOF without waiting for reaping.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnState::Closed {
                return;
            }
            *state = ConnState::Closed;
        }
        self.shutdown.send_replace(true);
        self.outbound.clear();
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            // Already gone if the peer reset first
            trace!(conn = self.id, error = %e, "Socket shutdown failed");
        }
        debug!(conn = self.id, peer = %self.peer, "Connection closed");
    }

    /// Queue a response for transmission.
    ///
    /// Starts a write chain only if none is in flight; otherwise the running
    /// chain picks the message up. Sending to a closed connection drops the
    /// message.
    pub fn send(self: &Arc<Self>, message: Message) {
        if self.is_closed() {
            trace!(
                conn = self.id,
                size = message.len(),
                "Dropping send on closed connection"
            );
            return;
        }

        self.outbound.push_back(message);

        if !self.write_in_flight.swap(true, Ordering::AcqRel) {
            let conn = Arc::clone(self);
            self.runtime.spawn(conn.write_chain());
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let shutdown = self.shutdown.subscribe();

        tokio::select! {
            result = self.read_pipeline(&mut reader) => {
                if let Err(e) = result {
                    if e.is_disconnect() {
                        debug!(conn = self.id, peer = %self.peer, error = %e, "Peer disconnected");
                    } else {
                        warn!(conn = self.id, peer = %self.peer, error = %e, "Read failed");
                    }
                }
            }
            _ = closed(shutdown) => {
                trace!(conn = self.id, "Read pipeline cancelled");
            }
        }

        self.close();
    }

    /// Frame messages until the socket fails or the connection closes.
    async fn read_pipeline(self: &Arc<Self>, reader: &mut OwnedReadHalf) -> Result<()> {
        let mut state = ReadState::AwaitingHeader;

        loop {
            state = match state {
                ReadState::AwaitingHeader => {
                    let header = read_header(reader, self.max_body_size).await?;
                    ReadState::AwaitingBody(header)
                }
                ReadState::AwaitingBody(header) => {
                    let message = read_body(reader, header).await?;
                    ReadState::Dispatching(message)
                }
                ReadState::Dispatching(message) => {
                    if !self.deliver(message) {
                        return Ok(());
                    }
                    ReadState::AwaitingHeader
                }
            };
        }
    }

    /// Push a framed message to the inbound queue unless the connection has
    /// closed. The state lock is held across the push so `close` cannot
    /// interleave.
    fn deliver(self: &Arc<Self>, message: Message) -> bool {
        let state = self.state.lock();
        if *state == ConnState::Closed {
            return false;
        }

        trace!(conn = self.id, kind = ?message.kind(), size = message.len(), "Message framed");
        self.inbound.push_back(TaggedMessage {
            origin: Arc::clone(self),
            message,
        });
        true
    }

    async fn write_chain(self: Arc<Self>) {
        let mut writer = self.writer.lock().await;

        loop {
            while let Some(message) = self.outbound.pop_front() {
                if self.is_closed() {
                    return;
                }

                if let Err(e) = write_message(&mut writer, &message).await {
                    if e.is_disconnect() {
                        debug!(
                            conn = self.id,
                            peer = %self.peer,
                            error = %e,
                            "Peer disconnected during write"
                        );
                    } else {
                        warn!(conn = self.id, peer = %self.peer, error = %e, "Write failed");
                    }
                    self.close();
                    return;
                }
            }

            self.write_in_flight.store(false, Ordering::Release);

            // A producer may have pushed after the queue emptied but before the
            // flag cleared; if it did not start its own chain, continue here.
            if self.outbound.is_empty() || self.write_in_flight.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}

/// Resolves once the shutdown flag is raised.
async fn closed(mut shutdown: watch::Receiver<bool>) {
    loop {
        let closed = *shutdown.borrow_and_update();
        if closed || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Write one frame, header then body.
async fn write_message(writer: &mut OwnedWriteHalf, message: &Message) -> Result<()> {
    let mut state = WriteState::WritingHeader;

    loop {
        match state {
            WriteState::WritingHeader => {
                writer.write_all(&message.header().to_bytes()).await?;
                state = WriteState::WritingBody;
            }
            WriteState::WritingBody => {
                writer.write_all(message.body()).await?;
                return Ok(());
            }
        }
    }
}

/// Registry of live connections using slab allocation.
///
/// Membership changes only at accept time (insert) and reap time (remove).
pub struct ConnectionRegistry {
    connections: Slab<Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Key the next inserted connection will receive.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn next_id(&self) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.vacant_key())
    }

    /// Insert a connection built with the key from [`next_id`](Self::next_id).
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Arc<Connection>) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let id = self.connections.insert(conn);
        Some(id)
    }

    /// Remove every connection that has reached `Closed`.
    ///
    /// Only drops the registry's share; pending tasks keep their own handle.
    pub fn reap(&mut self) -> usize {
        let before = self.connections.len();
        self.connections.retain(|_, conn| !conn.is_closed());
        before - self.connections.len()
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        for (_, conn) in self.connections.iter() {
            conn.close();
        }
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Drop every connection without closing it.
    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
