//! Descriptors, deadlines and readiness waits.
//!
//! This is the lowest layer of bytepipe. It knows nothing about buffering
//! or framing; it only offers:
//! - [`Descriptor`]: a pollable OS descriptor that can be read, written and closed
//! - [`Deadline`]: relative or absolute time limits for blocking calls
//! - [`wait_readable`] / [`wait_writable`]: bounded readiness waits on one descriptor
//! - [`SocketStream`]: a connected TCP or Unix stream socket

pub mod deadline;
pub mod error;

#[cfg(unix)]
pub mod descriptor;
#[cfg(unix)]
pub mod stream;
#[cfg(unix)]
pub mod wait;

pub use deadline::{Deadline, DEFAULT_DEADLINE, RELATIVE_THRESHOLD_SECS};
pub use error::{Result, TransportError};

#[cfg(unix)]
pub use descriptor::{set_nonblocking, Descriptor, PipeDescriptor};
#[cfg(unix)]
pub use stream::SocketStream;
#[cfg(unix)]
pub use wait::{poll_timeout_millis, wait_readable, wait_writable};
