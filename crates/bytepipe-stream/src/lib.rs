//! Chunked stream buffers and the background descriptor multiplexer.
//!
//! A [`ChunkedBuffer`] is an unbounded FIFO of bytes stored as a chain of
//! fixed-size [`Block`]s. Attach a readable descriptor and the
//! [`Multiplexer`] thread pours its bytes into the buffer; attach a writable
//! one and it drains the buffer into the descriptor, rolling back whatever
//! the descriptor did not accept.
//!
//! ```no_run
//! use std::process::{Command, Stdio};
//!
//! use bytepipe_stream::ChunkedBuffer;
//! use bytepipe_transport::PipeDescriptor;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut child = Command::new("ls").stdout(Stdio::piped()).spawn()?;
//! let stdout = child.stdout.take().ok_or("no stdout")?;
//!
//! let buffer = ChunkedBuffer::new();
//! buffer.attach_input(PipeDescriptor::new(stdout)?)?;
//!
//! while !(buffer.is_closed() && buffer.is_empty()) {
//!     let chunk = buffer.read(None);
//!     print!("{}", String::from_utf8_lossy(&chunk));
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

pub mod block;
pub mod buffer;
pub mod error;
pub mod multiplexer;
pub mod notifier;
mod worker;

pub use block::Block;
pub use buffer::{ChunkedBuffer, WeakBuffer};
pub use error::{Result, StreamError};
pub use multiplexer::{
    Direction, Multiplexer, MuxConfig, DEFAULT_CHUNK_SIZE, DEFAULT_IDLE_TIMEOUT, DEFAULT_TICK,
};
#[cfg(target_os = "linux")]
pub use notifier::EpollNotifier;
pub use notifier::{Interest, NotifierKind, PollNotifier, Readiness, ReadinessNotifier};
