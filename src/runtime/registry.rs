//! Registry of live connections.
//!
//! Owns both the slab of connection records and a handle to the poller's
//! watch set, so the two can only change together: a connection is tracked
//! if and only if its socket is registered, exactly once.

use crate::runtime::Connection;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use tracing::debug;

/// Registry of active connections using slab allocation.
///
/// Slab keys double as poll tokens. Provides O(1) insert, lookup and remove.
pub struct ConnectionRegistry {
    connections: Slab<Connection<TcpStream>>,
    registry: Registry,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry bound to a poller's watch set.
    pub fn new(registry: Registry, max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            registry,
            max_connections,
        }
    }

    /// Track a freshly accepted stream, watching it for readability.
    ///
    /// Fails if the stream cannot be registered, for example because its
    /// descriptor is already being watched. Nothing is tracked on failure
    /// and the stream is closed.
    pub fn add(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<Token> {
        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());

        let mut conn = Connection::new(stream, peer);
        let interest = conn.state().interest();
        self.registry.register(conn.stream_mut(), token, interest)?;
        entry.insert(conn);

        Ok(token)
    }

    /// Stop tracking a connection and close its socket.
    ///
    /// Returns the peer address of the removed connection, or `None` if the
    /// token was not tracked.
    pub fn remove(&mut self, token: Token) -> Option<SocketAddr> {
        let mut conn = self.connections.try_remove(token.0)?;
        if let Err(e) = self.registry.deregister(conn.stream_mut()) {
            debug!(conn_id = token.0, error = %e, "Deregister failed");
        }
        Some(conn.peer())
    }

    /// Change the readiness interest of a tracked connection.
    pub fn update_interest(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(token.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        self.registry.reregister(conn.stream_mut(), token, interest)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection<TcpStream>> {
        self.connections.get_mut(token.0)
    }

    /// Check if a connection exists.
    #[cfg(test)]
    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether the connection limit has been reached.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
