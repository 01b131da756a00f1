use std::os::fd::RawFd;

use crate::multiplexer::Direction;

/// Errors raised by buffers and the multiplexer.
///
/// Ordinary exhaustion is never an error; everything here is either caller
/// misuse or a failure to set up the readiness notifier.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The buffer already has a descriptor bound in this direction.
    #[error("buffer is already attached to {direction} descriptor")]
    AlreadyAttached { direction: Direction },

    /// The descriptor is already registered with the multiplexer.
    #[error("descriptor {fd} is already registered with the multiplexer")]
    DescriptorInUse { fd: RawFd },

    /// More bytes were rolled back than the previous read returned.
    #[error("tried to roll back {requested} bytes, but only {available} were available")]
    RollbackExceeded { requested: usize, available: usize },

    /// The buffer has been closed.
    #[error("buffer closed")]
    Closed,

    /// The OS readiness notifier could not be created or updated.
    #[error("readiness notifier error: {0}")]
    Notifier(std::io::Error),

    /// The multiplexer thread could not be spawned.
    #[error("failed to spawn multiplexer thread: {0}")]
    Spawn(std::io::Error),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] bytepipe_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, StreamError>;
