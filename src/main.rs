//! poll-echo: a single-threaded TCP echo server
//!
//! Every byte a client sends is written back to it unchanged. All clients
//! are served from one thread using readiness-based I/O (epoll/kqueue
//! through mio).
//!
//! Features:
//! - Per-connection read/write state machine with partial-write tracking
//! - Client errors close only the offending connection
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
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
        listen = %config.listen,
        max_connections = config.max_connections,
        read_size = config.read_size,
        "Starting poll-echo server"
    );

    runtime::run(config)?;
    Ok(())
}
