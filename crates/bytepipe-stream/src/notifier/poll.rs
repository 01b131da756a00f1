use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use bytepipe_transport::poll_timeout_millis;

use super::{Interest, Readiness, ReadinessNotifier};

/// `poll(2)` notifier.
///
/// Keeps the registration table in user space and rebuilds the `pollfd`
/// array on every wait, so cost grows with the number of descriptors.
#[derive(Default)]
pub struct PollNotifier {
    registrations: Vec<PollRegistration>,
    pollfds: Vec<libc::pollfd>,
}

#[derive(Debug, Clone, Copy)]
struct PollRegistration {
    fd: RawFd,
    token: u64,
    interest: Interest,
}

impl PollNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, fd: RawFd) -> Option<usize> {
        self.registrations.iter().position(|r| r.fd == fd)
    }
}

impl std::fmt::Debug for PollNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollNotifier")
            .field("registrations", &self.registrations)
            .finish()
    }
}

fn poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

impl ReadinessNotifier for PollNotifier {
    fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        if self.position(fd).is_some() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        self.registrations.push(PollRegistration {
            fd,
            token,
            interest,
        });
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let index = self
            .position(fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.registrations[index] = PollRegistration {
            fd,
            token,
            interest,
        };
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let index = self
            .position(fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.registrations.swap_remove(index);
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Duration) -> io::Result<usize> {
        self.pollfds.clear();
        self.pollfds
            .extend(self.registrations.iter().map(|r| libc::pollfd {
                fd: r.fd,
                events: poll_events(r.interest),
                revents: 0,
            }));

        // SAFETY: `pollfds` is a valid array of `len()` initialised entries that
        // is not touched by anything else for the duration of the call.
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                poll_timeout_millis(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let before = events.len();
        for (pollfd, registration) in self.pollfds.iter().zip(&self.registrations) {
            let revents = pollfd.revents;
            if revents == 0 {
                continue;
            }
            events.push(Readiness {
                token: registration.token,
                readable: revents & libc::POLLIN != 0,
                writable: revents & libc::POLLOUT != 0,
                hangup: revents & libc::POLLHUP != 0,
                error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(events.len() - before)
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
