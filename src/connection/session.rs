//! Per-connection state.
//!
//! A `Session` is owned by exactly one party at a time: the multiplexer while
//! it is parked waiting for readiness, or the pipeline job currently advancing
//! it. It is moved between them by value and is deliberately not `Clone`, so
//! no two jobs can ever hold the same connection's buffers.
//!
//! ## Buffer Management
//!
//! Incoming bytes accumulate in `read_buf` until the parser finds a complete
//! request. TCP is a stream protocol, so a read may deliver half a request or
//! several requests at once; whatever the parser does not consume stays
//! buffered for the next cycle.

use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::trace;

/// Bytes pulled off the socket per `read` call
const READ_CHUNK: usize = 4096;

/// Identifies a connection for its whole lifetime. Doubles as its poll token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

impl ConnId {
    pub fn token(self) -> Token {
        Token(self.0)
    }
}

impl From<Token> for ConnId {
    fn from(token: Token) -> Self {
        ConnId(token.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Client closed its side of the connection
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Socket accepted no bytes while output was still pending
    #[error("Socket closed while writing")]
    WriteZero,
}

impl ConnectionError {
    /// True for the usual ways a peer goes away, which are not worth a warning.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::ClientDisconnected | ConnectionError::WriteZero => true,
            ConnectionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }
}

/// Result of draining the write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything was written
    Done(usize),
    /// The socket stopped accepting data; the rest is still buffered
    Blocked(usize),
}

/// State for one client connection.
pub struct Session {
    id: ConnId,
    peer: SocketAddr,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Last request taken off `read_buf`, waiting for the Parse-and-Run stage
    command: Option<Result<RespValue, ParseError>>,
    close_after_write: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("buffered_input", &self.read_buf.len())
            .field("pending_output", &self.write_buf.len())
            .field("has_command", &self.command.is_some())
            .field("close_after_write", &self.close_after_write)
            .finish()
    }
}

impl Session {
    pub fn new(id: ConnId, stream: TcpStream, peer: SocketAddr, read_capacity: usize) -> Self {
        Self {
            id,
            peer,
            stream,
            read_buf: BytesMut::with_capacity(read_capacity),
            write_buf: BytesMut::new(),
            command: None,
            close_after_write: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Registers the socket with `registry` under this session's token.
    pub fn register(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, self.id.token(), interest)
    }

    /// Changes the interest the socket is registered with. This also re-arms
    /// the edge-triggered registration, so readiness that arrived while the
    /// session was away is reported again.
    pub fn reregister(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, self.id.token(), interest)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Reads until the socket would block or `limit` bytes have arrived, and
    /// returns the number of bytes appended to the read buffer. Zero is a
    /// normal outcome for a spurious wakeup; an orderly close from the peer
    /// is reported as [`ConnectionError::ClientDisconnected`].
    ///
    /// Stopping at `limit` can leave data in the socket. Re-registering the
    /// session reports it again.
    pub fn fill_read_buf(&mut self, limit: usize) -> Result<usize, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;

        while total < limit {
            let want = READ_CHUNK.min(limit - total);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => return Err(ConnectionError::ClientDisconnected),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        trace!(conn = %self.id, bytes = total, buffered = self.read_buf.len(), "Read data");
        Ok(total)
    }

    /// Tries to take one request off the front of the read buffer.
    ///
    /// Returns true when a request (or a parse failure to report) has been
    /// stored for the Parse-and-Run stage, false when more input is needed.
    pub fn parse_next(&mut self, parser: &RespParser) -> bool {
        debug_assert!(self.command.is_none(), "previous command not consumed");

        if self.read_buf.is_empty() {
            return false;
        }

        match parser.parse(&self.read_buf) {
            Ok(Some((value, consumed))) => {
                self.read_buf.advance(consumed);
                trace!(
                    conn = %self.id,
                    consumed = consumed,
                    remaining = self.read_buf.len(),
                    "Parsed command"
                );
                self.command = Some(Ok(value));
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.command = Some(Err(e));
                true
            }
        }
    }

    /// Stores a failure to report in place of a parsed request.
    pub fn reject(&mut self, error: ParseError) {
        self.command = Some(Err(error));
    }

    pub fn take_command(&mut self) -> Option<Result<RespValue, ParseError>> {
        self.command.take()
    }

    pub fn buffered_input(&self) -> usize {
        self.read_buf.len()
    }

    pub fn has_buffered_input(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// Drops unparsed input after a framing error; there is no way to find
    /// the start of the next request.
    pub fn discard_input(&mut self) {
        self.read_buf.clear();
    }

    pub fn queue_reply(&mut self, reply: &RespValue) {
        reply.write_to(&mut self.write_buf);
    }

    pub fn pending_output(&self) -> usize {
        self.write_buf.len()
    }

    pub fn close_after_write(&self) -> bool {
        self.close_after_write
    }

    pub fn set_close_after_write(&mut self) {
        self.close_after_write = true;
    }

    /// Writes as much of the write buffer as the socket accepts.
    pub fn flush(&mut self) -> Result<Flush, ConnectionError> {
        let mut total = 0;

        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(ConnectionError::WriteZero),
                Ok(n) => {
                    self.write_buf.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(conn = %self.id, bytes = total, pending = self.write_buf.len(), "Write blocked");
                    return Ok(Flush::Blocked(total));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        trace!(conn = %self.id, bytes = total, "Sent response");
        Ok(Flush::Done(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::time::{Duration, Instant};

    /// Returns a connected (server session, blocking client) pair.
    fn session_pair() -> (Session, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let session = Session::new(ConnId(1), TcpStream::from_std(server), peer, 64);
        (session, client)
    }

    /// Reads until at least `min` bytes are buffered or a second passes.
    fn read_at_least(session: &mut Session, min: usize) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + Duration::from_secs(1);
        while session.buffered_input() < min && Instant::now() < deadline {
            session.fill_read_buf(READ_CHUNK)?;
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    #[test]
    fn test_conn_id_token() {
        let id = ConnId(42);
        assert_eq!(id.token(), Token(42));
        assert_eq!(ConnId::from(Token(42)), id);
        assert_eq!(id.to_string(), "#42");
    }

    #[test]
    fn test_read_and_parse() {
        let (mut session, mut client) = session_pair();
        client.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").unwrap();

        read_at_least(&mut session, 22).unwrap();
        assert!(session.parse_next(&RespParser::new()));
        assert!(!session.has_buffered_input());

        let command = session.take_command().unwrap().unwrap();
        assert_eq!(
            command,
            RespValue::array(vec![
                RespValue::bulk_string("GET"),
                RespValue::bulk_string("foo"),
            ])
        );
        assert!(session.take_command().is_none());
    }

    #[test]
    fn test_partial_request_stays_buffered() {
        let (mut session, mut client) = session_pair();
        let parser = RespParser::new();

        client.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nf").unwrap();
        read_at_least(&mut session, 18).unwrap();
        assert!(!session.parse_next(&parser));
        assert_eq!(session.buffered_input(), 18);

        client.write_all(b"oo\r\n").unwrap();
        read_at_least(&mut session, 22).unwrap();
        assert!(session.parse_next(&parser));
        assert!(session.take_command().unwrap().is_ok());
    }

    #[test]
    fn test_pipelined_requests_parse_one_at_a_time() {
        let (mut session, mut client) = session_pair();
        let parser = RespParser::new();

        client.write_all(b"GET a\r\nGET b\r\n").unwrap();
        read_at_least(&mut session, 14).unwrap();

        assert!(session.parse_next(&parser));
        assert!(session.take_command().unwrap().is_ok());
        assert_eq!(session.buffered_input(), 7);

        assert!(session.parse_next(&parser));
        assert!(session.take_command().unwrap().is_ok());
        assert!(!session.has_buffered_input());
    }

    #[test]
    fn test_malformed_input_is_reported() {
        let (mut session, mut client) = session_pair();
        client.write_all(b"*1\r\n:5\r\n").unwrap();
        read_at_least(&mut session, 8).unwrap();

        assert!(session.parse_next(&RespParser::new()));
        assert!(session.take_command().unwrap().is_err());

        session.discard_input();
        assert!(!session.has_buffered_input());
    }

    #[test]
    fn test_peer_close_is_disconnect() {
        let (mut session, client) = session_pair();
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(1);
        let err = loop {
            match session.fill_read_buf(READ_CHUNK) {
                Err(e) => break e,
                Ok(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                Ok(_) => panic!("peer close not observed"),
            }
        };
        assert!(matches!(err, ConnectionError::ClientDisconnected));
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_read_stops_at_limit() {
        let (mut session, mut client) = session_pair();
        let sender = std::thread::spawn(move || {
            // Fails once the session is dropped with data unread
            let _ = client.write_all(&vec![b'x'; 4 * 1024 * 1024]);
        });

        let limit = 65_536 + 1;
        let deadline = Instant::now() + Duration::from_secs(2);
        while session.buffered_input() <= limit && Instant::now() < deadline {
            let n = session.fill_read_buf(limit).unwrap();
            assert!(n <= limit, "read {} bytes with a limit of {}", n, limit);
        }
        assert!(session.buffered_input() > limit);

        drop(session);
        sender.join().unwrap();
    }

    #[test]
    fn test_flush_writes_reply() {
        let (mut session, mut client) = session_pair();

        session.queue_reply(&RespValue::ok());
        session.queue_reply(&RespValue::integer(3));
        assert_eq!(session.pending_output(), 9);

        assert_eq!(session.flush().unwrap(), Flush::Done(9));
        assert_eq!(session.pending_output(), 0);

        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"+OK\r\n:3\r\n");
    }

    #[test]
    fn test_flush_with_nothing_pending() {
        let (mut session, _client) = session_pair();
        assert_eq!(session.flush().unwrap(), Flush::Done(0));
    }
}
