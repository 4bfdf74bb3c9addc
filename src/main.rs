//! echo-relay server
//!
//! Accepts typed, length-prefixed messages and answers each one on the
//! connection it arrived on:
//! - `InOrder`: body echoed unchanged
//! - `Reverse`: body echoed with its bytes reversed

use echo_relay::config::Config;
use echo_relay::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        version = echo_relay::VERSION,
        listen = %config.listen,
        workers = config.worker_threads(),
        max_body_size = config.max_body_size,
        reap_interval_ms = config.reap_interval_ms,
        "Starting echo-relay server"
    );

    runtime::run(config)?;
    Ok(())
}
