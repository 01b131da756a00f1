use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::error::{Result, TransportError};

/// A pollable OS descriptor that can be serviced by a readiness loop.
///
/// Pipes, subprocess handles and sockets all qualify. Implementations must
/// never block: a descriptor with nothing to offer reports
/// [`io::ErrorKind::WouldBlock`], and `read_some` returning `Ok(0)` means
/// end-of-stream.
pub trait Descriptor: Send + fmt::Debug {
    /// Descriptor number to hand to the readiness notifier.
    fn raw_fd(&self) -> RawFd;

    /// Read up to `buf.len()` bytes.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `data` as the descriptor accepts right now.
    fn write_some(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Release the descriptor. Closing twice is a no-op.
    fn close(&mut self);

    /// Whether [`Descriptor::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// A pipe, FIFO, socket or file descriptor switched to non-blocking mode.
pub struct PipeDescriptor {
    file: Option<File>,
    fd: RawFd,
}

impl PipeDescriptor {
    /// Take ownership of `fd` and switch it to non-blocking mode.
    ///
    /// Accepts anything convertible into an [`OwnedFd`]: `ChildStdout`,
    /// `ChildStdin`, `UnixStream`, `TcpStream`, `File`, ...
    pub fn new(fd: impl Into<OwnedFd>) -> Result<Self> {
        let owned: OwnedFd = fd.into();
        let raw = owned.as_raw_fd();
        set_nonblocking(raw)?;
        Ok(Self {
            file: Some(File::from(owned)),
            fd: raw,
        })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, TransportError::Closed))
    }
}

impl Descriptor for PipeDescriptor {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }

    fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file()?.write(data)
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(fd = self.fd, "descriptor closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl fmt::Debug for PipeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeDescriptor")
            .field("fd", &self.fd)
            .field("closed", &self.file.is_none())
            .finish()
    }
}

/// Set `O_NONBLOCK` on a descriptor.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL only read and update the status flags of `fd`;
    // an invalid descriptor is reported as EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: see above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
