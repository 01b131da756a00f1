//! OS readiness notification.
//!
//! The multiplexer talks to the kernel through [`ReadinessNotifier`], with
//! one implementation per mechanism:
//! - [`PollNotifier`]: `poll(2)`, available on every Unix
//! - [`EpollNotifier`]: `epoll(7)`, Linux only, scales with descriptor count
//!
//! [`NotifierKind::Auto`] picks the best one for the platform at startup.

mod poll;
pub use poll::PollNotifier;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::EpollNotifier;

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Events a registration wants to hear about.
///
/// Hang-up and error conditions are always reported, whatever the interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    /// Only hang-up and error conditions.
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
    };
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };

    pub fn is_readable(self) -> bool {
        self.readable
    }

    pub fn is_writable(self) -> bool {
        self.writable
    }
}

/// One readiness report from [`ReadinessNotifier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Token supplied at registration.
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// The peer closed its end.
    pub hangup: bool,
    /// The descriptor is in an error state (or invalid).
    pub error: bool,
}

/// A kernel readiness mechanism.
///
/// Registrations are keyed by descriptor and tagged with a caller-chosen
/// token that comes back in every [`Readiness`].
pub trait ReadinessNotifier: Send {
    /// Start watching `fd`.
    fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()>;

    /// Change the interest of a watched descriptor.
    fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`. Must be called before the descriptor is closed.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` and append ready descriptors to `events`.
    ///
    /// Returns the number of reports appended; an interrupted wait reports zero.
    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Duration) -> io::Result<usize>;

    /// Mechanism name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Which [`ReadinessNotifier`] the multiplexer builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifierKind {
    /// epoll on Linux, poll everywhere else.
    #[default]
    Auto,
    Poll,
    Epoll,
}

impl NotifierKind {
    /// Replace `Auto` with the concrete mechanism for this platform.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto if cfg!(target_os = "linux") => Self::Epoll,
            Self::Auto => Self::Poll,
            other => other,
        }
    }

    /// Create the notifier.
    pub fn build(self) -> io::Result<Box<dyn ReadinessNotifier>> {
        match self.resolve() {
            Self::Auto | Self::Poll => Ok(Box::new(PollNotifier::new())),
            #[cfg(target_os = "linux")]
            Self::Epoll => Ok(Box::new(EpollNotifier::new()?)),
            #[cfg(not(target_os = "linux"))]
            Self::Epoll => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "epoll is only available on Linux",
            )),
        }
    }
}

impl fmt::Display for NotifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Poll => "poll",
            Self::Epoll => "epoll",
        };
        f.write_str(name)
    }
}
