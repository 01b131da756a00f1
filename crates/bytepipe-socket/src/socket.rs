use std::io::{ErrorKind, Read, Write};
use std::net::ToSocketAddrs;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Instant;

use bytepipe_transport::{wait_readable, wait_writable, Deadline, SocketStream};
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::codec::{encode_message, parse_header, HEADER_SIZE};
use crate::endpoint::Endpoint;
use crate::error::{Result, SocketError};

/// Bytes requested per read while scanning for a pattern.
const UNTIL_CHUNK_SIZE: usize = 100;
/// Upper bound on a single read while collecting a known length.
const READ_CHUNK_SIZE: usize = 64 * 1024;
/// Never preallocate more than this for an incoming payload.
const MAX_PREALLOC: usize = 1024 * 1024;

/// A non-blocking stream socket whose receives are bounded by a [`Deadline`].
///
/// Every blocking call waits on socket readiness rather than spinning, and
/// gives up when its deadline passes. Running out of time is reported as
/// `Ok(None)`; a peer that goes away mid-read is [`SocketError::Closed`].
///
/// Messages on the wire are an 8-byte ASCII length header followed by the
/// payload; see [`crate::codec`].
///
/// # Example
///
/// ```
/// use bytepipe_socket::FramedSocket;
///
/// let (mut left, mut right) = FramedSocket::pair().unwrap();
/// left.send_message(b"hello").unwrap();
/// let reply = right.receive_message(None).unwrap().unwrap();
/// assert_eq!(&reply[..], b"hello");
/// ```
#[derive(Debug)]
pub struct FramedSocket {
    stream: SocketStream,
    deadline: Deadline,
    // received but not yet handed out; survives timeouts
    pending: BytesMut,
}

impl FramedSocket {
    /// Connect over TCP using the default deadline.
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        Self::connect_with_deadline(addr, Deadline::default())
    }

    /// Connect over TCP, giving up when `deadline` passes.
    ///
    /// `deadline` also becomes the socket's default for later calls.
    pub fn connect_with_deadline(
        addr: impl ToSocketAddrs + std::fmt::Debug,
        deadline: Deadline,
    ) -> Result<Self> {
        let timeout = deadline
            .expires_at()
            .saturating_duration_since(Instant::now());
        let stream = SocketStream::connect_tcp(addr, timeout)?;
        let mut socket = Self::from_stream(stream)?;
        socket.deadline = deadline;
        Ok(socket)
    }

    /// Connect to a listening Unix domain socket using the default deadline.
    pub fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_unix_with_deadline(path, Deadline::default())
    }

    /// Connect to a Unix domain socket, giving up when `deadline` passes.
    ///
    /// `deadline` also becomes the socket's default for later calls.
    pub fn connect_unix_with_deadline(path: impl AsRef<Path>, deadline: Deadline) -> Result<Self> {
        let timeout = deadline
            .expires_at()
            .saturating_duration_since(Instant::now());
        let stream = SocketStream::connect_unix(path, timeout)?;
        let mut socket = Self::from_stream(stream)?;
        socket.deadline = deadline;
        Ok(socket)
    }

    /// Connect to either kind of [`Endpoint`].
    pub fn connect_endpoint(endpoint: &Endpoint, deadline: Deadline) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Self::connect_with_deadline(addr.as_str(), deadline),
            Endpoint::Unix(path) => Self::connect_unix_with_deadline(path, deadline),
        }
    }

    /// Wrap an already connected stream, switching it to non-blocking mode.
    pub fn from_stream(stream: SocketStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            deadline: Deadline::default(),
            pending: BytesMut::new(),
        })
    }

    /// A connected pair of Unix domain sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = SocketStream::pair()?;
        Ok((Self::from_stream(left)?, Self::from_stream(right)?))
    }

    /// Deadline applied when a call passes `None`.
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: impl Into<Deadline>) {
        self.deadline = deadline.into();
    }

    /// Receive exactly `n` bytes.
    ///
    /// Returns `Ok(None)` if the deadline passes first. Bytes that did arrive
    /// stay buffered, so a later receive picks up where this one stopped. A
    /// peer that closes before `n` bytes have arrived is
    /// [`SocketError::Closed`].
    pub fn receive_exact(
        &mut self,
        n: usize,
        deadline: Option<Deadline>,
    ) -> Result<Option<Bytes>> {
        let expires = self.expiry(deadline);
        if !self.fill_to(n, expires)? {
            return Ok(None);
        }
        Ok(Some(self.pending.split_to(n).freeze()))
    }

    /// Receive until the accumulated bytes contain `pattern`.
    ///
    /// Returns everything up to and including the first match; anything read
    /// past it stays buffered. An empty pattern matches immediately.
    pub fn receive_until(
        &mut self,
        pattern: &[u8],
        deadline: Option<Deadline>,
    ) -> Result<Option<Bytes>> {
        let expires = self.expiry(deadline);
        let found = self.fill_until(expires, |received| {
            find(received, pattern).map(|at| at + pattern.len())
        })?;
        Ok(found.map(|end| self.pending.split_to(end).freeze()))
    }

    /// Receive until `matches` accepts the accumulated bytes.
    ///
    /// Reads in small increments and returns everything accumulated when the
    /// predicate first holds.
    pub fn receive_until_match<F>(
        &mut self,
        mut matches: F,
        deadline: Option<Deadline>,
    ) -> Result<Option<Bytes>>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let expires = self.expiry(deadline);
        let found = self.fill_until(expires, |received| {
            matches(received).then_some(received.len())
        })?;
        Ok(found.map(|end| self.pending.split_to(end).freeze()))
    }

    /// Receive one length-prefixed message.
    ///
    /// Header and payload share one deadline. Nothing is consumed until the
    /// whole message has arrived, so after a timeout the next call resumes
    /// the same message.
    pub fn receive_message(&mut self, deadline: Option<Deadline>) -> Result<Option<Bytes>> {
        let expires = self.expiry(deadline);
        if !self.fill_to(HEADER_SIZE, expires)? {
            return Ok(None);
        }
        let size = match parse_header(&self.pending[..HEADER_SIZE]) {
            Ok(size) => size,
            Err(err) => {
                warn!(error = %err, "unparsable message header");
                self.pending.advance(HEADER_SIZE);
                return Err(err);
            }
        };

        if !self.fill_to(HEADER_SIZE + size, expires)? {
            let received = self.pending.len() - HEADER_SIZE;
            debug!(size, received, "message incomplete at deadline");
            return Ok(None);
        }
        self.pending.advance(HEADER_SIZE);
        debug!(size, "read <-- {size}");
        Ok(Some(self.pending.split_to(size).freeze()))
    }

    /// Bytes received but not yet returned by any receive.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Send one length-prefixed message.
    ///
    /// The header and payload go out as one contiguous frame. If the socket
    /// stops accepting data and the default deadline passes with only part of
    /// the frame sent, the connection is unusable and
    /// [`SocketError::PartialSend`] is returned.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::new();
        encode_message(payload, &mut frame)?;
        debug!(size = payload.len(), "write --> {}", payload.len());

        let expires = self.deadline.expires_at();
        let mut sent = 0usize;
        while sent < frame.len() {
            match self.stream.write(&frame[sent..]) {
                Ok(0) => return Err(SocketError::Closed),
                Ok(n) => sent += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    let remaining = expires.saturating_duration_since(Instant::now());
                    if !wait_writable(self.stream.as_raw_fd(), remaining)? {
                        warn!(sent, expected = frame.len(), "send deadline passed mid-frame");
                        return Err(SocketError::PartialSend {
                            sent,
                            expected: frame.len(),
                        });
                    }
                }
                Err(err) if is_disconnect(err.kind()) => return Err(SocketError::Closed),
                Err(err) => return Err(SocketError::Io(err)),
            }
        }
        Ok(())
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &SocketStream {
        &self.stream
    }

    /// Consume the socket and return the inner stream (still non-blocking).
    ///
    /// Bytes already buffered by an earlier receive are dropped.
    pub fn into_inner(self) -> SocketStream {
        self.stream
    }

    /// Human-readable peer address for logging.
    pub fn peer_label(&self) -> String {
        self.stream.peer_label()
    }

    /// Shut down both halves of the connection.
    pub fn shutdown(&self) -> Result<()> {
        self.stream.shutdown().map_err(Into::into)
    }

    fn expiry(&self, deadline: Option<Deadline>) -> Instant {
        deadline.unwrap_or(self.deadline).expires_at()
    }

    fn wait_readable(&self, expires: Instant) -> Result<bool> {
        let remaining = expires.saturating_duration_since(Instant::now());
        Ok(wait_readable(self.stream.as_raw_fd(), remaining)?)
    }

    /// Read until at least `n` bytes are buffered. `false` on timeout.
    fn fill_to(&mut self, n: usize, expires: Instant) -> Result<bool> {
        if self.pending.len() < n {
            self.pending.reserve((n - self.pending.len()).min(MAX_PREALLOC));
        }
        while self.pending.len() < n {
            if !self.wait_readable(expires)? {
                debug!(wanted = n, buffered = self.pending.len(), "receive timed out");
                return Ok(false);
            }
            let want = (n - self.pending.len()).min(READ_CHUNK_SIZE);
            read_into(&mut self.stream, &mut self.pending, want)?;
        }
        Ok(true)
    }

    /// Read in small increments until `split_at` names a prefix to return.
    fn fill_until<F>(&mut self, expires: Instant, mut split_at: F) -> Result<Option<usize>>
    where
        F: FnMut(&[u8]) -> Option<usize>,
    {
        loop {
            if let Some(end) = split_at(&self.pending[..]) {
                return Ok(Some(end));
            }
            if !self.wait_readable(expires)? {
                debug!(buffered = self.pending.len(), "receive_until timed out");
                return Ok(None);
            }
            read_into(&mut self.stream, &mut self.pending, UNTIL_CHUNK_SIZE)?;
        }
    }
}

/// Append up to `want` bytes from a socket that just reported readable.
fn read_into(stream: &mut SocketStream, buf: &mut BytesMut, want: usize) -> Result<()> {
    let start = buf.len();
    buf.resize(start + want, 0);
    loop {
        match stream.read(&mut buf[start..]) {
            Ok(0) => {
                buf.truncate(start);
                debug!(buffered = start, "peer closed connection");
                return Err(SocketError::Closed);
            }
            Ok(n) => {
                buf.truncate(start + n);
                trace!(bytes = n, "socket read");
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                buf.truncate(start);
                return Ok(());
            }
            Err(err) if is_disconnect(err.kind()) => {
                buf.truncate(start);
                return Err(SocketError::Closed);
            }
            Err(err) => {
                buf.truncate(start);
                return Err(SocketError::Io(err));
            }
        }
    }
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn short() -> Option<Deadline> {
        Some(Deadline::after(Duration::from_millis(50)))
    }

    #[test]
    fn message_round_trip() {
        let (mut left, mut right) = FramedSocket::pair().unwrap();
        left.send_message(b"QUERY_RECORDINGS Play").unwrap();
        let got = right.receive_message(None).unwrap().unwrap();
        assert_eq!(got.as_ref(), b"QUERY_RECORDINGS Play");
    }

    #[test]
    fn empty_message_round_trip() {
        let (mut left, mut right) = FramedSocket::pair().unwrap();
        left.send_message(b"").unwrap();
        let got = right.receive_message(None).unwrap().unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn receive_exact_times_out_with_none() {
        let (_left, mut right) = FramedSocket::pair().unwrap();
        let start = Instant::now();
        assert!(right.receive_exact(4, short()).unwrap().is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    }

    #[test]
    fn receive_exact_collects_fragments() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        let writer = std::thread::spawn(move || {
            for piece in [&b"ab"[..], b"cd", b"ef"] {
                raw.write_all(piece).unwrap();
                std::thread::sleep(Duration::from_millis(10));
            }
            raw
        });
        let got = right.receive_exact(6, None).unwrap().unwrap();
        assert_eq!(got.as_ref(), b"abcdef");
        writer.join().unwrap();
    }

    #[test]
    fn peer_close_mid_read_is_fatal() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        raw.write_all(b"12").unwrap();
        drop(raw);
        assert!(matches!(
            right.receive_exact(4, None),
            Err(SocketError::Closed)
        ));
    }

    #[test]
    fn receive_until_finds_pattern() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        raw.write_all(b"login: ").unwrap();
        let got = right.receive_until(b"login:", None).unwrap().unwrap();
        assert_eq!(got.as_ref(), b"login:");
    }

    #[test]
    fn receive_until_times_out_without_match() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        raw.write_all(b"nothing useful").unwrap();
        assert!(right.receive_until(b"OK", short()).unwrap().is_none());
    }

    #[test]
    fn receive_until_match_uses_predicate() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        raw.write_all(b"line one\nline two\n").unwrap();
        let got = right
            .receive_until_match(|b| b.iter().filter(|&&c| c == b'\n').count() >= 2, None)
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), b"line one\nline two\n");
    }

    #[test]
    fn malformed_header_is_reported() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        raw.write_all(b"garbage!").unwrap();
        assert!(matches!(
            right.receive_message(None),
            Err(SocketError::MalformedHeader(_))
        ));
    }

    #[test]
    fn socket_deadline_is_the_default() {
        let (_left, mut right) = FramedSocket::pair().unwrap();
        right.set_deadline(0.05);
        assert_eq!(right.deadline(), Deadline::after(Duration::from_millis(50)));
        let start = Instant::now();
        assert!(right.receive_message(None).unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn send_to_closed_peer_fails() {
        let (mut left, right) = FramedSocket::pair().unwrap();
        drop(right);
        let err = left.send_message(b"hello?").unwrap_err();
        assert!(matches!(err, SocketError::Closed), "got {err:?}");
    }

    /// A TCP pair whose server end is reset by closing with unread data.
    fn reset_tcp_client() -> FramedSocket {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = FramedSocket::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.send_message(b"never read").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        drop(server);
        std::thread::sleep(Duration::from_millis(50));
        client
    }

    #[test]
    fn reset_peer_is_closed_on_receive() {
        let mut client = reset_tcp_client();
        let err = client
            .receive_exact(4, Some(Deadline::after(Duration::from_secs(2))))
            .unwrap_err();
        assert!(matches!(err, SocketError::Closed), "got {err:?}");
    }

    #[test]
    fn reset_peer_is_closed_on_send() {
        let mut client = reset_tcp_client();
        let err = (0..20)
            .find_map(|_| {
                let sent = client.send_message(b"still there?");
                std::thread::sleep(Duration::from_millis(10));
                sent.err()
            })
            .expect("sending to a reset peer never failed");
        assert!(matches!(err, SocketError::Closed), "got {err:?}");
    }

    #[test]
    fn timed_out_message_resumes_on_next_receive() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        let writer = std::thread::spawn(move || {
            for piece in [&b"5       "[..], b"hello", b"3       abc"] {
                raw.write_all(piece).unwrap();
                std::thread::sleep(Duration::from_millis(150));
            }
            raw
        });

        let mut got = Vec::new();
        let mut timeouts = 0;
        while got.len() < 2 {
            match right.receive_message(short()).unwrap() {
                Some(message) => got.push(message),
                None => timeouts += 1,
            }
            assert!(timeouts < 100, "messages never completed");
        }
        assert_eq!(got[0].as_ref(), b"hello");
        assert_eq!(got[1].as_ref(), b"abc");
        assert!(timeouts > 0);
        assert_eq!(right.buffered(), 0);
        writer.join().unwrap();
    }

    #[test]
    fn timed_out_exact_receive_keeps_partial_bytes() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        raw.write_all(b"abc").unwrap();
        assert!(right.receive_exact(6, short()).unwrap().is_none());
        assert_eq!(right.buffered(), 3);
        raw.write_all(b"def").unwrap();
        let got = right.receive_exact(6, short()).unwrap().unwrap();
        assert_eq!(got.as_ref(), b"abcdef");
    }

    #[test]
    fn receive_until_leaves_the_remainder_buffered() {
        let (left, mut right) = FramedSocket::pair().unwrap();
        let mut raw = left.into_inner();
        raw.write_all(b"user: 2       hi").unwrap();
        let prompt = right.receive_until(b": ", None).unwrap().unwrap();
        assert_eq!(prompt.as_ref(), b"user: ");
        let message = right.receive_message(None).unwrap().unwrap();
        assert_eq!(message.as_ref(), b"hi");
    }

    #[test]
    fn unix_connect_honors_the_deadline() {
        let path = std::env::temp_dir().join(format!("bytepipe-framed-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        // SAFETY: re-listening on a bound socket only shrinks its backlog.
        assert_eq!(unsafe { libc::listen(listener.as_raw_fd(), 0) }, 0);

        let endpoint = Endpoint::Unix(path.clone());
        let deadline = Deadline::after(Duration::from_millis(100));
        let mut queued = Vec::new();
        let start = Instant::now();
        let err = loop {
            match FramedSocket::connect_endpoint(&endpoint, deadline) {
                Ok(socket) => queued.push(socket),
                Err(err) => break err,
            }
            assert!(queued.len() < 16, "backlog never filled");
        };
        assert!(matches!(err, SocketError::Transport(_)), "got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(5));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stalled_peer_yields_partial_send() {
        let (mut left, _right) = FramedSocket::pair().unwrap();
        left.set_deadline(Deadline::after(Duration::from_millis(50)));
        let payload = vec![7u8; 8 * 1024 * 1024];
        match left.send_message(&payload) {
            Err(SocketError::PartialSend { sent, expected }) => {
                assert!(sent < expected);
                assert_eq!(expected, HEADER_SIZE + payload.len());
            }
            other => panic!("expected partial send, got {other:?}"),
        }
    }
}
