use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Block until `fd` is readable (or hung up), or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. A hang-up counts as ready: the next read
/// reports the closure.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    wait_for(fd, libc::POLLIN, timeout)
}

/// Block until `fd` accepts writes (or hung up), or `timeout` elapses.
pub fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    wait_for(fd, libc::POLLOUT, timeout)
}

fn wait_for(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let start = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        let mut pollfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };

        // SAFETY: `pollfd` is a valid, initialised array of length 1 that lives
        // for the duration of the call.
        let rc = unsafe { libc::poll(&mut pollfd, 1, poll_timeout_millis(remaining)) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(false);
        }
        if pollfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        return Ok(true);
    }
}

/// Convert a wait into poll(2) milliseconds, rounding up so a short
/// positive wait never degrades into a zero-timeout poll.
pub fn poll_timeout_millis(timeout: Duration) -> libc::c_int {
    let mut millis = timeout.as_millis();
    if timeout.subsec_nanos() % 1_000_000 != 0 {
        millis += 1;
    }
    millis.min(libc::c_int::MAX as u128) as libc::c_int
}
