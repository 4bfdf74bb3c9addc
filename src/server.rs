//! TCP server for relay connections.
//!
//! Accepts connections on the I/O runtime and routes every framed message
//! through a [`Handler`] on a dedicated dispatch thread, sending the
//! response back to the connection it came from.

use parking_lot::Mutex;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::{EchoHandler, Handler};
use crate::runtime::{self, Connection, ConnectionRegistry, TaggedMessage, TsQueue};

/// Pause after a failed accept before re-arming
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How long `stop` waits for in-flight I/O tasks
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server instance
///
/// The server owns its own multi-threaded runtime, so `start` and
/// `wait_for_shutdown_signal` block the calling thread and must be called
/// from synchronous code. Inside a Tokio context they return
/// [`Error::InsideRuntime`]; wrap them in `spawn_blocking` there instead.
/// `stop` and `Drop` are safe from either side.
pub struct Server {
    config: Config,
    handler: Arc<dyn Handler>,
    inbound: Arc<TsQueue<TaggedMessage>>,
    connections: Arc<Mutex<ConnectionRegistry>>,
    running: Arc<AtomicBool>,
    runtime: Option<Runtime>,
    dispatcher: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a server that echoes requests with [`EchoHandler`].
    pub fn new(config: Config) -> Self {
        Self::with_handler(config, Arc::new(EchoHandler))
    }

    /// Create a server with a custom application handler.
    pub fn with_handler(config: Config, handler: Arc<dyn Handler>) -> Self {
        let connections = ConnectionRegistry::new(config.max_connections);

        Server {
            config,
            handler,
            inbound: Arc::new(TsQueue::new()),
            connections: Arc::new(Mutex::new(connections)),
            running: Arc::new(AtomicBool::new(false)),
            runtime: None,
            dispatcher: None,
            local_addr: None,
        }
    }

    /// Bind the listener and start the accept and dispatch loops.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.runtime.is_some() {
            return Err(Error::AlreadyRunning);
        }
        if Handle::try_current().is_ok() {
            return Err(Error::InsideRuntime);
        }

        let workers = self.config.worker_threads();
        let runtime = runtime::build(workers)?;
        let listener = runtime.block_on(TcpListener::bind(&self.config.listen))?;
        let addr = listener.local_addr()?;

        self.running.store(true, Ordering::Release);

        runtime.spawn(accept_loop(
            listener,
            Arc::clone(&self.connections),
            Arc::clone(&self.inbound),
            self.config.max_body_size,
            runtime.handle().clone(),
        ));

        let dispatcher = {
            let inbound = Arc::clone(&self.inbound);
            let connections = Arc::clone(&self.connections);
            let handler = Arc::clone(&self.handler);
            let running = Arc::clone(&self.running);
            let cycle = self.config.reap_interval();

            thread::Builder::new()
                .name("dispatch".to_string())
                .spawn(move || dispatch_loop(&inbound, &connections, &*handler, &running, cycle))
        };
        let dispatcher = match dispatcher {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
                return Err(e.into());
            }
        };

        info!(
            address = %addr,
            workers,
            max_connections = self.config.max_connections,
            max_body_size = self.config.max_body_size,
            "Server started"
        );

        self.runtime = Some(runtime);
        self.dispatcher = Some(dispatcher);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Stop accepting, close every connection and join the dispatch thread.
    ///
    /// Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        self.connections.lock().close_all();

        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                error!("Dispatch thread panicked");
            }
        }

        if Handle::try_current().is_ok() {
            // Blocking on worker shutdown is not allowed here
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }

        self.inbound.clear();
        self.connections.lock().clear();
        self.local_addr = None;

        info!("Server stopped");
    }

    /// Block the calling thread until Ctrl-C.
    pub fn wait_for_shutdown_signal(&self) -> Result<()> {
        if Handle::try_current().is_ok() {
            return Err(Error::InsideRuntime);
        }
        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(tokio::signal::ctrl_c())?),
            None => Ok(()),
        }
    }

    /// Check if the accept and dispatch loops are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of connections currently registered.
    pub fn live_connections(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Admit peers until the runtime shuts down.
async fn accept_loop(
    listener: TcpListener,
    connections: Arc<Mutex<ConnectionRegistry>>,
    inbound: Arc<TsQueue<TaggedMessage>>,
    max_body_size: u64,
    runtime: Handle,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let conn = {
            let mut registry = connections.lock();
            let Some(id) = registry.next_id() else {
                warn!(
                    peer = %peer,
                    max = registry.capacity(),
                    "Connection limit reached, rejecting"
                );
                continue;
            };

            let conn = Connection::new(
                id,
                stream,
                Arc::clone(&inbound),
                max_body_size,
                runtime.clone(),
            );
            let conn = match conn {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to set up connection");
                    continue;
                }
            };
            registry.insert(Arc::clone(&conn));
            conn
        };

        debug!(conn = conn.id(), peer = %peer, "New connection");
        conn.start();
    }
}

/// Wait for inbound messages, answer them, reap closed connections.
///
/// Each cycle waits at most `cycle` so reaping and shutdown are observed
/// even when no traffic arrives.
fn dispatch_loop(
    inbound: &TsQueue<TaggedMessage>,
    connections: &Mutex<ConnectionRegistry>,
    handler: &dyn Handler,
    running: &AtomicBool,
    cycle: Duration,
) {
    while running.load(Ordering::Acquire) {
        if inbound.wait_timeout(cycle) {
            for tagged in inbound.drain() {
                let origin = Arc::clone(&tagged.origin);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(handler, tagged)));
                if let Err(payload) = outcome {
                    error!(
                        conn = origin.id(),
                        peer = %origin.peer_addr(),
                        panic = panic_message(&*payload),
                        "Handler panicked, closing connection"
                    );
                    origin.close();
                }
            }
        }

        let reaped = connections.lock().reap();
        if reaped > 0 {
            debug!(reaped, "Reaped closed connections");
        }
    }
}

/// Route one message through the handler back to its origin.
fn dispatch(handler: &dyn Handler, tagged: TaggedMessage) {
    let TaggedMessage { origin, message } = tagged;
    trace!(
        conn = origin.id(),
        kind = ?message.kind(),
        size = message.len(),
        "Dispatching"
    );

    let response = handler.handle(message);
    origin.send(response);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::protocol::{Message, MessageHeader, MessageKind};
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Instant;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.listen = "127.0.0.1:0".to_string();
        config.workers = Some(2);
        config.reap_interval_ms = 20;
        config
    }

    fn start_server(config: Config) -> (Server, u16) {
        let mut server = Server::new(config);
        let addr = server.start().unwrap();
        (server, addr.port())
    }

    fn connect(port: u16) -> Client {
        let mut client = Client::new();
        client.connect("127.0.0.1", port).unwrap();
        client
    }

    fn wait_for(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_in_order_echo() {
        let (_server, port) = start_server(test_config());
        let mut client = connect(port);

        let response = client
            .request(&Message::with_body(MessageKind::InOrder, "hello"))
            .unwrap();
        assert_eq!(response.kind(), MessageKind::InOrder);
        assert_eq!(response.body(), b"hello");
    }

    #[test]
    fn test_reverse_echo() {
        let (_server, port) = start_server(test_config());
        let mut client = connect(port);

        let mut response = client
            .request(&Message::with_body(MessageKind::Reverse, "hello"))
            .unwrap();
        assert_eq!(response.take_string(), "olleh");
    }

    #[test]
    fn test_empty_body() {
        let (_server, port) = start_server(test_config());
        let mut client = connect(port);

        for kind in [MessageKind::InOrder, MessageKind::Reverse] {
            let response = client.request(&Message::new(kind)).unwrap();
            assert_eq!(response.kind(), kind);
            assert!(response.is_empty());
        }
        assert!(client.is_connected());
    }

    #[test]
    fn test_pipelined_requests() {
        let (_server, port) = start_server(test_config());
        let mut client = connect(port);

        let bodies: Vec<String> = (0..20).map(|i| format!("req-{i}")).collect();
        for body in &bodies {
            client
                .send(&Message::with_body(MessageKind::InOrder, body))
                .unwrap();
        }
        for body in &bodies {
            assert_eq!(client.receive().unwrap().body(), body.as_bytes());
        }
    }

    #[test]
    fn test_concurrent_clients_get_their_own_responses() {
        let (_server, port) = start_server(test_config());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                thread::spawn(move || {
                    let mut client = connect(port);
                    for round in 0..25 {
                        let body = format!("client-{i}-round-{round}");
                        let response = client
                            .request(&Message::with_body(MessageKind::Reverse, &body))
                            .unwrap();
                        let expected: Vec<u8> = body.bytes().rev().collect();
                        assert_eq!(response.body(), &expected[..]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_disconnect_mid_body_is_reaped() {
        let (server, port) = start_server(test_config());

        let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
        wait_for(|| server.live_connections() == 1);

        let wire = Message::with_body(MessageKind::InOrder, "never finished").encode();
        raw.write_all(&wire[..wire.len() - 5]).unwrap();
        drop(raw);

        wait_for(|| server.live_connections() == 0);

        // The server keeps serving other peers
        let mut client = connect(port);
        let response = client
            .request(&Message::with_body(MessageKind::InOrder, "still up"))
            .unwrap();
        assert_eq!(response.body(), b"still up");
    }

    #[test]
    fn test_oversized_header_drops_connection() {
        let mut config = test_config();
        config.max_body_size = 16;
        let (server, port) = start_server(config);

        let mut client = connect(port);
        client
            .request(&Message::with_body(MessageKind::InOrder, "warm"))
            .unwrap();

        let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
        wait_for(|| server.live_connections() == 2);

        let header = MessageHeader {
            kind: MessageKind::InOrder,
            size: 1 << 32,
        };
        raw.write_all(&header.to_bytes()).unwrap();
        wait_for(|| server.live_connections() == 1);

        // Unaffected peer
        let response = client
            .request(&Message::with_body(MessageKind::Reverse, "ok"))
            .unwrap();
        assert_eq!(response.body(), b"ko");
    }

    #[test]
    fn test_start_twice_and_stop() {
        let (mut server, port) = start_server(test_config());
        assert!(server.is_running());
        assert_eq!(server.local_addr().map(|a| a.port()), Some(port));
        assert!(matches!(server.start(), Err(Error::AlreadyRunning)));

        let mut client = connect(port);
        client
            .request(&Message::with_body(MessageKind::InOrder, "x"))
            .unwrap();

        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.live_connections(), 0);
        assert!(server.local_addr().is_none());

        // Peers see the connection drop
        assert!(client
            .request(&Message::with_body(MessageKind::InOrder, "y"))
            .is_err());

        server.stop();
    }

    #[test]
    fn test_custom_handler() {
        struct Upper;
        impl Handler for Upper {
            fn handle(&self, message: Message) -> Message {
                let body = message.body().to_ascii_uppercase();
                Message::with_body(message.kind(), body)
            }
        }

        let mut server = Server::with_handler(test_config(), Arc::new(Upper));
        let port = server.start().unwrap().port();

        let mut client = connect(port);
        let response = client
            .request(&Message::with_body(MessageKind::InOrder, "shout"))
            .unwrap();
        assert_eq!(response.body(), b"SHOUT");
    }

    #[test]
    fn test_handler_panic_closes_only_its_connection() {
        struct Fragile;
        impl Handler for Fragile {
            fn handle(&self, message: Message) -> Message {
                if message.body() == b"boom" {
                    panic!("cannot handle boom");
                }
                message
            }
        }

        let mut server = Server::with_handler(test_config(), Arc::new(Fragile));
        let port = server.start().unwrap().port();

        let mut bystander = connect(port);
        bystander
            .request(&Message::with_body(MessageKind::InOrder, "before"))
            .unwrap();

        let mut victim = connect(port);
        assert!(victim
            .request(&Message::with_body(MessageKind::InOrder, "boom"))
            .is_err());

        // Dispatch survives: existing and new peers are still answered
        let response = bystander
            .request(&Message::with_body(MessageKind::InOrder, "after"))
            .unwrap();
        assert_eq!(response.body(), b"after");

        let mut newcomer = connect(port);
        let response = newcomer
            .request(&Message::with_body(MessageKind::Reverse, "fine"))
            .unwrap();
        assert_eq!(response.body(), b"enif");

        assert!(server.is_running());
        wait_for(|| server.live_connections() == 2);
    }

    #[tokio::test]
    async fn test_start_inside_runtime_is_rejected() {
        let mut server = Server::new(test_config());
        assert!(matches!(server.start(), Err(Error::InsideRuntime)));
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_drop_inside_runtime() {
        let (server, port) = start_server(test_config());
        let mut client = connect(port);
        client
            .request(&Message::with_body(MessageKind::InOrder, "x"))
            .unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            assert!(matches!(
                server.wait_for_shutdown_signal(),
                Err(Error::InsideRuntime)
            ));
            drop(server);
        });

        assert!(client
            .request(&Message::with_body(MessageKind::InOrder, "y"))
            .is_err());
    }
}
