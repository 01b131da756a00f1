use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use bytepipe_transport::poll_timeout_millis;

use tracing::debug;

use super::{Interest, Readiness, ReadinessNotifier};

const MAX_EVENTS: usize = 64;

/// `epoll(7)` notifier.
///
/// Registrations live in the kernel; a wait costs O(ready) rather than
/// O(registered).
///
/// epoll refuses regular files and block devices (`EPERM`). Those are kept
/// on a side list and reported ready on every wait, matching what `poll(2)`
/// says about them.
pub struct EpollNotifier {
    epfd: OwnedFd,
    buffer: Vec<libc::epoll_event>,
    always_ready: HashMap<RawFd, (u64, Interest)>,
}

impl EpollNotifier {
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 has no pointer arguments; a negative return is an error.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by epoll_create1 and is owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            epfd,
            buffer: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
            always_ready: HashMap::new(),
        })
    }

    fn control(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_events(interest),
            u64: token,
        };
        // SAFETY: `event` is a valid epoll_event for the duration of the call;
        // the kernel copies it and keeps no pointer.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn epoll_events(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.is_readable() {
        events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

impl ReadinessNotifier for EpollNotifier {
    fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        match self.control(libc::EPOLL_CTL_ADD, fd, token, interest) {
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                debug!(fd, "descriptor not pollable by epoll, treating as always ready");
                self.always_ready.insert(fd, (token, interest));
                Ok(())
            }
            other => other,
        }
    }

    fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        if let Some(slot) = self.always_ready.get_mut(&fd) {
            *slot = (token, interest);
            return Ok(());
        }
        self.control(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.always_ready.remove(&fd).is_some() {
            return Ok(());
        }
        self.control(libc::EPOLL_CTL_DEL, fd, 0, Interest::NONE)
    }

    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Duration) -> io::Result<usize> {
        let before = events.len();
        for &(token, interest) in self.always_ready.values() {
            if interest.is_readable() || interest.is_writable() {
                events.push(Readiness {
                    token,
                    readable: interest.is_readable(),
                    writable: interest.is_writable(),
                    ..Readiness::default()
                });
            }
        }
        let synthetic = events.len() - before;
        // don't sleep while a file still has work
        let timeout = if synthetic > 0 { Duration::ZERO } else { timeout };

        // SAFETY: `buffer` holds MAX_EVENTS initialised entries and the kernel
        // writes at most that many.
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buffer.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                poll_timeout_millis(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(synthetic);
            }
            return Err(err);
        }

        let ready = rc as usize;
        for raw in &self.buffer[..ready] {
            // epoll_event is packed on some targets; copy fields out by value.
            let flags = raw.events;
            let token = raw.u64;
            events.push(Readiness {
                token,
                readable: flags & libc::EPOLLIN as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                hangup: flags & libc::EPOLLHUP as u32 != 0,
                error: flags & libc::EPOLLERR as u32 != 0,
            });
        }
        Ok(synthetic + ready)
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl std::fmt::Debug for EpollNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollNotifier")
            .field("epfd", &self.epfd.as_raw_fd())
            .field("always_ready", &self.always_ready.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn regular_files_are_reported_ready_without_blocking() {
        let path = std::env::temp_dir().join(format!("bytepipe-epoll-{}", std::process::id()));
        let file = File::create(&path).unwrap();
        let fd = file.as_raw_fd();
        let mut notifier = EpollNotifier::new().unwrap();
        notifier.register(fd, 7, Interest::READABLE).unwrap();

        let mut events = Vec::new();
        let start = std::time::Instant::now();
        assert_eq!(notifier.wait(&mut events, Duration::from_secs(5)).unwrap(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(events[0].token, 7);
        assert!(events[0].readable);

        // no interest: nothing reported, the wait sleeps as usual
        notifier.modify(fd, 7, Interest::NONE).unwrap();
        events.clear();
        assert_eq!(notifier.wait(&mut events, Duration::from_millis(20)).unwrap(), 0);

        notifier.modify(fd, 7, Interest::WRITABLE).unwrap();
        events.clear();
        notifier.wait(&mut events, Duration::from_millis(20)).unwrap();
        assert!(events[0].writable && !events[0].readable);

        notifier.deregister(fd).unwrap();
        events.clear();
        assert_eq!(notifier.wait(&mut events, Duration::from_millis(20)).unwrap(), 0);
        let _ = std::fs::remove_file(&path);
    }
}
