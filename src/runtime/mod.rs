//! Networking runtime.
//!
//! Built on a multi-threaded Tokio runtime:
//! - `TsQueue`: blocking queue bridging I/O tasks and the dispatch thread
//! - `Connection`: per-socket read pipeline and write chain
//! - `ConnectionRegistry`: live connections, keyed by slab slot

mod connection;
mod queue;

pub use connection::{ConnState, Connection, ConnectionRegistry, TaggedMessage};
pub use queue::TsQueue;

use crate::config::Config;
use crate::error::Result;
use crate::server::Server;
use tokio::runtime::Runtime;
use tracing::info;

/// Build the I/O runtime with `workers` threads.
pub fn build(workers: usize) -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("echo-relay-io")
        .enable_all()
        .build()
}

/// Run the server until Ctrl-C.
pub fn run(config: Config) -> Result<()> {
    let mut server = Server::new(config);
    let addr = server.start()?;
    info!(address = %addr, "Server listening");

    server.wait_for_shutdown_signal()?;
    info!("Received Ctrl-C, shutting down");

    server.stop();
    Ok(())
}
