use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::descriptor::set_nonblocking;
use crate::error::{Result, TransportError};
use crate::wait::wait_writable;

/// Pause between attempts while a listener's backlog is full.
const BACKLOG_RETRY: Duration = Duration::from_millis(5);

/// A connected stream socket, either TCP or Unix domain.
///
/// Wraps either a TCP connection to a remote backend or a local Unix
/// domain socket.
pub struct SocketStream {
    inner: SocketStreamInner,
}

enum SocketStreamInner {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SocketStreamInner::Tcp(stream) => stream.read(buf),
            SocketStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SocketStreamInner::Tcp(stream) => stream.write(buf),
            SocketStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            SocketStreamInner::Tcp(stream) => stream.flush(),
            SocketStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl AsRawFd for SocketStream {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            SocketStreamInner::Tcp(stream) => stream.as_raw_fd(),
            SocketStreamInner::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl From<TcpStream> for SocketStream {
    fn from(stream: TcpStream) -> Self {
        Self {
            inner: SocketStreamInner::Tcp(stream),
        }
    }
}

impl From<UnixStream> for SocketStream {
    fn from(stream: UnixStream) -> Self {
        Self {
            inner: SocketStreamInner::Unix(stream),
        }
    }
}

impl SocketStream {
    /// Connect over TCP, trying each resolved address with `timeout`.
    ///
    /// The timeout applies per address; the last failure is reported.
    pub fn connect_tcp(addr: impl ToSocketAddrs + std::fmt::Debug, timeout: Duration) -> Result<Self> {
        let label = format!("{addr:?}");
        let addrs = addr.to_socket_addrs().map_err(|e| TransportError::Connect {
            addr: label.clone(),
            source: e,
        })?;

        let mut last_err = None;
        for resolved in addrs {
            // connect_timeout rejects a zero duration.
            let timeout = timeout.max(Duration::from_millis(1));
            match TcpStream::connect_timeout(&resolved, timeout) {
                Ok(stream) => {
                    debug!(addr = %resolved, "connected over tcp");
                    return Ok(stream.into());
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(TransportError::Connect {
            addr: label,
            source: last_err.unwrap_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "address resolved to nothing",
                )
            }),
        })
    }

    /// Connect to a listening Unix domain socket, giving up after `timeout`.
    ///
    /// A listener whose accept backlog is full makes a plain `connect` block
    /// indefinitely, so the attempt is made non-blocking and retried until the
    /// timeout passes. The returned stream is in blocking mode.
    pub fn connect_unix(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let connect_err = |source| TransportError::Connect {
            addr: path.display().to_string(),
            source,
        };
        let stream = connect_unix_until(path, Instant::now() + timeout).map_err(connect_err)?;
        stream.set_nonblocking(false)?;
        debug!(?path, "connected to unix domain socket");
        Ok(stream.into())
    }

    /// A connected pair of Unix stream sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((left.into(), right.into()))
    }

    /// Switch the socket between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            SocketStreamInner::Tcp(stream) => stream.set_nonblocking(nonblocking),
            SocketStreamInner::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
        .map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            SocketStreamInner::Tcp(stream) => Ok(stream.try_clone()?.into()),
            SocketStreamInner::Unix(stream) => Ok(stream.try_clone()?.into()),
        }
    }

    /// Shut down both halves of the connection.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            SocketStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
            SocketStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
        }
        .map_err(Into::into)
    }

    /// Human-readable peer address for logging.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            SocketStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            SocketStreamInner::Unix(_) => "unix".to_string(),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            SocketStreamInner::Tcp(_) => "tcp",
            SocketStreamInner::Unix(_) => "unix-domain-socket",
        }
    }
}

impl std::fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketStream")
            .field("type", &self.transport_name())
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

fn connect_unix_until(path: &Path, expires: Instant) -> io::Result<UnixStream> {
    let (addr, len) = unix_sockaddr(path)?;
    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just created and nothing else owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: F_SETFD only updates the descriptor flags of `fd`.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fd)?;

    loop {
        // SAFETY: `addr` is an initialised sockaddr_un and `len` covers the
        // family plus the NUL-terminated path.
        let rc = unsafe {
            libc::connect(fd, (&addr as *const libc::sockaddr_un).cast(), len)
        };
        if rc == 0 {
            return Ok(UnixStream::from(owned));
        }
        let err = io::Error::last_os_error();
        let remaining = expires.saturating_duration_since(Instant::now());
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            // backlog full
            Some(libc::EAGAIN) => {
                if remaining.is_zero() {
                    return Err(io::Error::new(ErrorKind::TimedOut, "listener backlog stayed full"));
                }
                std::thread::sleep(BACKLOG_RETRY.min(remaining));
            }
            Some(libc::EINPROGRESS) => {
                if !wait_writable(fd, remaining)? {
                    return Err(io::Error::new(ErrorKind::TimedOut, "connect timed out"));
                }
                return match pending_error(fd)? {
                    0 => Ok(UnixStream::from(owned)),
                    code => Err(io::Error::from_raw_os_error(code)),
                };
            }
            _ => return Err(err),
        }
    }
}

fn unix_sockaddr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain data; all zeroes is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.contains(&0) {
        return Err(io::Error::new(ErrorKind::InvalidInput, "socket path contains a NUL byte"));
    }
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "socket path is too long"));
    }
    for (slot, byte) in addr.sun_path.iter_mut().zip(bytes) {
        *slot = *byte as libc::c_char;
    }

    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn pending_error(fd: RawFd) -> io::Result<libc::c_int> {
    let mut code: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `code` and `len` are valid for writes and sized for SO_ERROR.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut code as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::net::UnixListener;

    #[test]
    fn tcp_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut client = SocketStream::connect_tcp(addr, Duration::from_secs(2)).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let (mut server, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        handle.join().unwrap();
    }

    #[test]
    fn tcp_connect_refused_reports_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = SocketStream::connect_tcp(addr, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn unix_connect_missing_path_fails() {
        let path = std::env::temp_dir().join(format!("bytepipe-missing-{}.sock", std::process::id()));
        let err = SocketStream::connect_unix(&path, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn unix_connect_gives_up_when_backlog_is_full() {
        let path = std::env::temp_dir().join(format!("bytepipe-backlog-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        // SAFETY: re-listening on a bound socket only shrinks its backlog.
        assert_eq!(unsafe { libc::listen(listener.as_raw_fd(), 0) }, 0);

        let mut queued = Vec::new();
        let start = Instant::now();
        let err = loop {
            match SocketStream::connect_unix(&path, Duration::from_millis(100)) {
                Ok(stream) => queued.push(stream),
                Err(err) => break err,
            }
            assert!(queued.len() < 16, "backlog never filled");
        };
        let elapsed = start.elapsed();

        match err {
            TransportError::Connect { source, .. } => assert_eq!(source.kind(), ErrorKind::TimedOut),
            other => panic!("expected connect timeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(90), "gave up after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "gave up after {elapsed:?}");

        let (mut accepted, _) = listener.accept().unwrap();
        let mut first = queued.remove(0);
        first.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pair_round_trip_and_clone() {
        let (mut left, right) = SocketStream::pair().unwrap();
        let mut cloned = right.try_clone().unwrap();
        left.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        cloned.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(right.transport_name(), "unix-domain-socket");
    }
}
