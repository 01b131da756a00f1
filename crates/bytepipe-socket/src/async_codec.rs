use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_message, encode_message, MAX_PAYLOAD};
use crate::error::SocketError;

/// `tokio_util` codec for the 8-byte length-header wire format.
///
/// Wrap any `AsyncRead + AsyncWrite` in `tokio_util::codec::Framed` with
/// this codec to exchange messages with a [`crate::FramedSocket`] peer.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_payload: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD)
    }

    /// Reject incoming messages larger than `max_payload` bytes.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = SocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_message(src, self.max_payload)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() => Ok(None),
            None => Err(SocketError::Closed),
        }
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = SocketError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_message(&item, dst)
    }
}

impl Encoder<&[u8]> for MessageCodec {
    type Error = SocketError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_message(item, dst)
    }
}
