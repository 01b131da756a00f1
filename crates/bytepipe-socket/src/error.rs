/// Errors raised by framed sockets.
///
/// A receive that runs out of time is not an error; it returns `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Connecting, binding or accepting failed.
    #[error("transport error: {0}")]
    Transport(#[from] bytepipe_transport::TransportError),

    /// An I/O error occurred while reading or writing.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection while a read was in progress.
    #[error("connection closed by peer")]
    Closed,

    /// The 8-byte length header is not a decimal number.
    #[error("malformed length header {0:?}")]
    MalformedHeader(String),

    /// The payload length does not fit in the header.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The deadline expired with only part of a frame sent.
    #[error("partial send ({sent} of {expected} bytes)")]
    PartialSend { sent: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, SocketError>;
