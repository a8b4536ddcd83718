//! Connection state machine for echo clients.
//!
//! Each connection alternates between two states: reading one chunk from
//! the client, then writing that chunk back until it is fully flushed.
//! A connection never reads more while it still holds unflushed output,
//! so its buffer is bounded by a single read.
//!
//! The step functions are generic over any `Read + Write` stream and report
//! what the caller has to do next (nothing, re-arm interest, or close)
//! instead of touching the poller themselves.

use bytes::BytesMut;
use mio::Interest;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for data from the client. Buffer is empty.
    Reading,
    /// Echoing buffered data back to the client.
    Writing,
}

impl ConnState {
    /// Readiness interest registered while in this state.
    pub fn interest(self) -> Interest {
        match self {
            ConnState::Reading => Interest::READABLE,
            ConnState::Writing => Interest::WRITABLE,
        }
    }
}

/// Why a connection is being torn down.
#[derive(Debug)]
pub enum CloseReason {
    /// Read returned end-of-stream.
    PeerClosed,
    /// Unrecoverable I/O error on this connection only.
    Io(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Io(e) => write!(f, "{e}"),
        }
    }
}

/// Outcome of advancing a connection by one readiness event.
#[derive(Debug)]
pub enum Step {
    /// Nothing changed that the poller needs to know about.
    Idle,
    /// State changed; the registered interest must be updated.
    Rearm(Interest),
    /// The connection must be removed and its socket closed.
    Close(CloseReason),
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    /// Bytes read from the client and not yet fully echoed.
    buffer: BytesMut,
    /// Bytes of `buffer` already written back.
    write_offset: usize,
}

impl<S> Connection<S> {
    /// Create a new connection in initial reading state.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            buffer: BytesMut::new(),
            write_offset: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    #[cfg(test)]
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    #[cfg(test)]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

impl<S: Read + Write> Connection<S> {
    /// Advance the state machine after the stream was reported ready.
    ///
    /// `scratch` bounds how much a single read may pull from the client.
    pub fn advance(&mut self, scratch: &mut [u8]) -> Step {
        match self.state {
            ConnState::Reading => self.on_readable(scratch),
            ConnState::Writing => self.on_writable(),
        }
    }

    fn on_readable(&mut self, scratch: &mut [u8]) -> Step {
        debug_assert!(!scratch.is_empty(), "read scratch must not be empty");

        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Step::Close(CloseReason::PeerClosed),
                Ok(n) => {
                    self.buffer.extend_from_slice(&scratch[..n]);
                    self.state = ConnState::Writing;
                    return Step::Rearm(ConnState::Writing.interest());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Step::Close(CloseReason::Io(e)),
            }
        }
    }

    fn on_writable(&mut self) -> Step {
        // Readiness is edge-triggered: keep writing until the kernel pushes back.
        while self.write_offset < self.buffer.len() {
            match self.stream.write(&self.buffer[self.write_offset..]) {
                Ok(0) => {
                    return Step::Close(CloseReason::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => {
                    debug_assert!(self.write_offset + n <= self.buffer.len());
                    self.write_offset += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Step::Close(CloseReason::Io(e)),
            }
        }

        self.buffer.clear();
        self.write_offset = 0;
        self.state = ConnState::Reading;
        Step::Rearm(ConnState::Reading.interest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory stream that replays scripted read and write outcomes.
    ///
    /// An exhausted script reports `WouldBlock`. `Ok(limit)` on the write side
    /// accepts at most `limit` bytes.
    #[derive(Default)]
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        writes: VecDeque<io::Result<usize>>,
        written: Vec<u8>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Ok(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.writes.pop_front() {
                Some(Ok(limit)) => {
                    let n = limit.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection() -> Connection<ScriptedStream> {
        Connection::new(ScriptedStream::default(), "127.0.0.1:40000".parse().unwrap())
    }

    fn is_rearm(step: &Step, interest: Interest) -> bool {
        matches!(step, Step::Rearm(i) if *i == interest)
    }

    #[test]
    fn test_ping_then_ten_bytes() {
        let mut conn = connection();
        let mut scratch = [0u8; 1024];

        conn.stream_mut().reads.push_back(Ok(b"ping".to_vec()));
        conn.stream_mut().writes.push_back(Ok(usize::MAX));

        let step = conn.advance(&mut scratch);
        assert!(is_rearm(&step, Interest::WRITABLE));
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.buffered(), b"ping");

        let step = conn.advance(&mut scratch);
        assert!(is_rearm(&step, Interest::READABLE));
        assert_eq!(conn.state(), ConnState::Reading);
        assert!(conn.buffered().is_empty());
        assert_eq!(conn.write_offset(), 0);
        assert_eq!(conn.stream_mut().written, b"ping");

        // Ten bytes flushed across two writable events.
        conn.stream_mut().reads.push_back(Ok(b"0123456789".to_vec()));
        conn.stream_mut().writes.push_back(Ok(4));
        conn.stream_mut().writes.push_back(Ok(4));

        assert!(is_rearm(&conn.advance(&mut scratch), Interest::WRITABLE));
        assert!(matches!(conn.advance(&mut scratch), Step::Idle));
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.write_offset(), 8);

        conn.stream_mut().writes.push_back(Ok(usize::MAX));
        assert!(is_rearm(&conn.advance(&mut scratch), Interest::READABLE));
        assert_eq!(conn.stream_mut().written, b"ping0123456789");
    }

    #[test]
    fn test_partial_writes_advance_offset_monotonically() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut conn = connection();
        let mut scratch = vec![0u8; 4096];

        conn.stream_mut().reads.push_back(Ok(payload.clone()));
        assert!(is_rearm(&conn.advance(&mut scratch), Interest::WRITABLE));

        let mut last_offset = 0;
        loop {
            // One short write per writable event, then the socket is full.
            conn.stream_mut().writes.push_back(Ok(7));
            match conn.advance(&mut scratch) {
                Step::Idle => {
                    assert!(conn.write_offset() > last_offset);
                    assert_eq!(conn.write_offset(), last_offset + 7);
                    last_offset = conn.write_offset();
                }
                Step::Rearm(interest) => {
                    assert_eq!(interest, Interest::READABLE);
                    break;
                }
                Step::Close(reason) => panic!("unexpected close: {reason}"),
            }
        }

        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.write_offset(), 0);
        assert_eq!(conn.stream_mut().written, payload);
    }

    #[test]
    fn test_read_bounded_by_scratch() {
        let mut conn = connection();
        let mut scratch = [0u8; 4];

        conn.stream_mut().reads.push_back(Ok(b"abcdefgh".to_vec()));
        conn.stream_mut().writes.push_back(Ok(usize::MAX));

        assert!(is_rearm(&conn.advance(&mut scratch), Interest::WRITABLE));
        assert_eq!(conn.buffered(), b"abcd");
        assert!(is_rearm(&conn.advance(&mut scratch), Interest::READABLE));

        conn.stream_mut().writes.push_back(Ok(usize::MAX));
        assert!(is_rearm(&conn.advance(&mut scratch), Interest::WRITABLE));
        assert_eq!(conn.buffered(), b"efgh");
        assert!(is_rearm(&conn.advance(&mut scratch), Interest::READABLE));

        assert_eq!(conn.stream_mut().written, b"abcdefgh");
    }

    #[test]
    fn test_read_would_block_is_noop() {
        let mut conn = connection();
        let mut scratch = [0u8; 16];

        assert!(matches!(conn.advance(&mut scratch), Step::Idle));
        assert_eq!(conn.state(), ConnState::Reading);
        assert!(conn.buffered().is_empty());
    }

    #[test]
    fn test_write_would_block_is_noop() {
        let mut conn = connection();
        let mut scratch = [0u8; 16];

        conn.stream_mut().reads.push_back(Ok(b"hello".to_vec()));
        conn.advance(&mut scratch);

        assert!(matches!(conn.advance(&mut scratch), Step::Idle));
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.write_offset(), 0);
    }

    #[test]
    fn test_eof_closes() {
        let mut conn = connection();
        let mut scratch = [0u8; 16];

        conn.stream_mut().reads.push_back(Ok(Vec::new()));
        assert!(matches!(
            conn.advance(&mut scratch),
            Step::Close(CloseReason::PeerClosed)
        ));
    }

    #[test]
    fn test_read_error_closes() {
        let mut conn = connection();
        let mut scratch = [0u8; 16];

        conn.stream_mut()
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));
        match conn.advance(&mut scratch) {
            Step::Close(CloseReason::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_write_error_closes() {
        let mut conn = connection();
        let mut scratch = [0u8; 16];

        conn.stream_mut().reads.push_back(Ok(b"hello".to_vec()));
        conn.stream_mut().writes.push_back(Ok(2));
        conn.stream_mut()
            .writes
            .push_back(Err(io::ErrorKind::BrokenPipe.into()));
        conn.advance(&mut scratch);

        match conn.advance(&mut scratch) {
            Step::Close(CloseReason::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected step: {:?}", other),
        }
        assert_eq!(conn.stream_mut().written, b"he");
    }

    #[test]
    fn test_write_zero_closes() {
        let mut conn = connection();
        let mut scratch = [0u8; 16];

        conn.stream_mut().reads.push_back(Ok(b"hello".to_vec()));
        conn.stream_mut().writes.push_back(Ok(0));
        conn.advance(&mut scratch);

        match conn.advance(&mut scratch) {
            Step::Close(CloseReason::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_interrupted_io_is_retried() {
        let mut conn = connection();
        let mut scratch = [0u8; 16];

        let stream = conn.stream_mut();
        stream.reads.push_back(Err(io::ErrorKind::Interrupted.into()));
        stream.reads.push_back(Ok(b"hi".to_vec()));
        stream.writes.push_back(Err(io::ErrorKind::Interrupted.into()));
        stream.writes.push_back(Ok(usize::MAX));

        assert!(is_rearm(&conn.advance(&mut scratch), Interest::WRITABLE));
        assert!(is_rearm(&conn.advance(&mut scratch), Interest::READABLE));
        assert_eq!(conn.stream_mut().written, b"hi");
    }

    #[test]
    fn test_state_interest() {
        assert_eq!(ConnState::Reading.interest(), Interest::READABLE);
        assert_eq!(ConnState::Writing.interest(), Interest::WRITABLE);
    }
}
