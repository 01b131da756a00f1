//! Deadline-bounded sockets with a length-header wire format.
//!
//! Every message is an 8-byte ASCII decimal length, left-justified and
//! space padded, followed by exactly that many payload bytes:
//!
//! ```text
//! b"5       hello"
//! ```
//!
//! Receives wait on socket readiness and give up at a [`Deadline`]; running
//! out of time returns `Ok(None)` rather than an error.
//!
//! [`Deadline`]: bytepipe_transport::Deadline

#![cfg(unix)]

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod socket;

#[cfg(feature = "async")]
pub use async_codec::MessageCodec;
pub use codec::{decode_message, encode_header, encode_message, parse_header, HEADER_SIZE, MAX_PAYLOAD};
pub use endpoint::Endpoint;
pub use error::{Result, SocketError};
pub use listener::FramedListener;
pub use socket::FramedSocket;
