/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on a descriptor or stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The descriptor has already been closed.
    #[error("descriptor closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
