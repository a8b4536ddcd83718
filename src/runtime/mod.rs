//! Single-threaded readiness runtime.
//!
//! Built on mio (epoll on Linux, kqueue on macOS). The pieces:
//! - `Connection`: per-client echo state machine
//! - `ConnectionRegistry`: tracked connections, kept in lockstep with the watch set
//! - `EchoServer`: listener plus the poll/dispatch loop

mod connection;
mod event_loop;
mod registry;

pub(crate) use connection::{CloseReason, Connection, Step};
#[cfg(test)]
pub(crate) use connection::ConnState;
pub(crate) use registry::ConnectionRegistry;

pub use event_loop::EchoServer;

use crate::config::Config;
use tracing::info;

/// Bind the listener and serve clients on the current thread.
///
/// Returns only if startup or the poll wait fails.
pub fn run(config: Config) -> std::io::Result<()> {
    let mut server = EchoServer::bind(&config)?;

    info!(
        addr = %server.local_addr()?,
        backlog = config.backlog,
        max_connections = config.max_connections,
        read_size = config.read_size,
        "Listening"
    );

    server.run()
}
