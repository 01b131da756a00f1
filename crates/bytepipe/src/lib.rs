//! Chunked stream buffers, a background descriptor multiplexer and
//! deadline-bounded framed sockets.
//!
//! # Crate Structure
//!
//! - [`transport`]: descriptors, deadlines and readiness waits
//! - [`stream`]: `ChunkedBuffer` and the `Multiplexer` thread that feeds and drains it
//! - [`socket`]: `FramedSocket` with the 8-byte ASCII length header

/// Re-export transport types.
pub mod transport {
    pub use bytepipe_transport::*;
}

/// Re-export buffer and multiplexer types.
pub mod stream {
    pub use bytepipe_stream::*;
}

/// Re-export framed socket types.
pub mod socket {
    pub use bytepipe_socket::*;
}

#[cfg(unix)]
pub use bytepipe_socket::{Endpoint, FramedListener, FramedSocket, SocketError};
#[cfg(unix)]
pub use bytepipe_stream::{ChunkedBuffer, Multiplexer, MuxConfig, StreamError};
pub use bytepipe_transport::{Deadline, TransportError};
