//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on the calling thread; the poll wait is the only place
//! the loop blocks.
//!
//! ## Removal during a pass
//!
//! Connections are never removed while the event batch is being walked.
//! A connection that has to close is marked, later events for it in the same
//! batch are skipped, and all marked connections are removed once the batch
//! is done. Since a marked slot stays occupied until then, an accept in the
//! same pass cannot be handed the token of a connection that is going away.

use crate::config::Config;
use crate::runtime::{CloseReason, ConnectionRegistry, Step};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Single-threaded echo server: listener, poller and connection registry.
pub struct EchoServer {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry,
    /// Reused for every read call.
    scratch: Vec<u8>,
    /// Connections marked for removal during the current pass.
    closing: HashMap<Token, CloseReason>,
}

impl EchoServer {
    /// Bind the listening socket and set up the poller.
    ///
    /// Any failure here is fatal for the server.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.listen, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let connections =
            ConnectionRegistry::new(poll.registry().try_clone()?, config.max_connections);

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            listener,
            connections,
            scratch: vec![0u8; config.read_size],
            closing: HashMap::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of tracked client connections.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serve clients until the poll wait itself fails.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// Wait for readiness once and dispatch every event in the batch.
    ///
    /// `None` blocks until at least one socket is ready.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut rearm_listener = false;

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    if !accept_connections(&self.listener, &mut self.connections) {
                        rearm_listener = true;
                    }
                }
                token => {
                    if self.closing.contains_key(&token) {
                        continue;
                    }
                    if let Some(reason) =
                        service_connection(&mut self.connections, token, &mut self.scratch)
                    {
                        self.closing.insert(token, reason);
                    }
                }
            }
        }

        for (token, reason) in self.closing.drain() {
            close_connection(&mut self.connections, token, reason);
        }

        if rearm_listener {
            self.rearm_listener()?;
        }

        Ok(())
    }

    /// Re-register the listener so connections still queued in the backlog
    /// are reported again on the next wait.
    ///
    /// Readiness is edge-triggered: once an accept pass stops on an error,
    /// no new edge arrives for connections that were already pending.
    fn rearm_listener(&mut self) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
    }
}

/// Accept until the backlog is drained.
///
/// Returns `false` if the pass stopped on an accept error first.
fn accept_connections(listener: &TcpListener, connections: &mut ConnectionRegistry) -> bool {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if connections.is_full() {
                    warn!(
                        peer = %peer,
                        max_connections = connections.capacity(),
                        "Connection limit reached, rejecting connection"
                    );
                    continue;
                }

                match connections.add(stream, peer) {
                    Ok(token) => debug!(conn_id = token.0, peer = %peer, "Accepted connection"),
                    Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                error!("Accept error: {}", e);
                return false;
            }
        }
    }
}

/// Advance one connection. Returns a reason if it has to be closed.
fn service_connection(
    connections: &mut ConnectionRegistry,
    token: Token,
    scratch: &mut [u8],
) -> Option<CloseReason> {
    let conn = connections.get_mut(token)?;

    match conn.advance(scratch) {
        Step::Idle => None,
        Step::Rearm(interest) => {
            trace!(conn_id = token.0, state = ?conn.state(), "Connection transitioned");
            connections
                .update_interest(token, interest)
                .err()
                .map(CloseReason::Io)
        }
        Step::Close(reason) => Some(reason),
    }
}

fn close_connection(connections: &mut ConnectionRegistry, token: Token, reason: CloseReason) {
    if let Some(peer) = connections.remove(token) {
        match reason {
            CloseReason::PeerClosed => debug!(
                conn_id = token.0,
                peer = %peer,
                remaining = connections.len(),
                "Connection closed by peer"
            ),
            CloseReason::Io(e) => warn!(
                conn_id = token.0,
                peer = %peer,
                error = %e,
                remaining = connections.len(),
                "Connection error, closing"
            ),
        }
    }
}

/// Create a non-blocking listening socket with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}
