use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SocketError};

/// Width of the ASCII length header.
pub const HEADER_SIZE: usize = 8;

/// Largest payload whose length fits in [`HEADER_SIZE`] decimal digits.
pub const MAX_PAYLOAD: usize = 99_999_999;

/// Render the header for a payload of `len` bytes.
///
/// The length is written in decimal, left-justified and padded with spaces
/// to [`HEADER_SIZE`] bytes: `5` becomes `b"5       "`.
pub fn encode_header(len: usize) -> Result<[u8; HEADER_SIZE]> {
    if len > MAX_PAYLOAD {
        return Err(SocketError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        });
    }
    let text = format!("{len:<width$}", width = HEADER_SIZE);
    let mut header = [b' '; HEADER_SIZE];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Parse a header back into a payload length.
///
/// Surrounding spaces are ignored, so both left- and right-justified
/// headers are accepted.
pub fn parse_header(header: &[u8]) -> Result<usize> {
    let malformed = || SocketError::MalformedHeader(String::from_utf8_lossy(header).into_owned());

    if header.len() != HEADER_SIZE {
        return Err(malformed());
    }
    let text = std::str::from_utf8(header).map_err(|_| malformed())?.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    text.parse::<usize>().map_err(|_| malformed())
}

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────────────────┬──────────────────┐
/// │ Length (8B ASCII)      │ Payload          │
/// │ decimal, left-justified│ (Length bytes)   │
/// │ space padded           │                  │
/// └────────────────────────┴──────────────────┘
/// ```
pub fn encode_message(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let header = encode_header(payload.len())?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&header);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer.
pub fn decode_message(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let payload_len = parse_header(&src[..HEADER_SIZE])?;
    if payload_len > max_payload {
        return Err(SocketError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_left_justified_and_space_padded() {
        assert_eq!(&encode_header(0).unwrap(), b"0       ");
        assert_eq!(&encode_header(42).unwrap(), b"42      ");
        assert_eq!(&encode_header(MAX_PAYLOAD).unwrap(), b"99999999");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(matches!(
            encode_header(MAX_PAYLOAD + 1),
            Err(SocketError::PayloadTooLarge { size, max }) if size == MAX_PAYLOAD + 1 && max == MAX_PAYLOAD
        ));
    }

    #[test]
    fn parse_accepts_either_padding() {
        assert_eq!(parse_header(b"17      ").unwrap(), 17);
        assert_eq!(parse_header(b"      17").unwrap(), 17);
        assert_eq!(parse_header(b"00000017").unwrap(), 17);
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in [&b"        "[..], b"12ab    ", b"-1      ", b"1 2     ", b"123"] {
            assert!(
                matches!(parse_header(bad), Err(SocketError::MalformedHeader(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn encode_then_decode() {
        let mut buf = BytesMut::new();
        encode_message(b"QUERY_LOAD", &mut buf).unwrap();
        assert_eq!(&buf[..HEADER_SIZE], b"10      ");

        let payload = decode_message(&mut buf, MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"QUERY_LOAD");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_message() {
        let mut buf = BytesMut::from(&b"5   "[..]);
        assert!(decode_message(&mut buf, MAX_PAYLOAD).unwrap().is_none());

        buf.put_slice(b"    abc");
        assert!(decode_message(&mut buf, MAX_PAYLOAD).unwrap().is_none());

        buf.put_slice(b"de");
        let payload = decode_message(&mut buf, MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"abcde");
    }

    #[test]
    fn decode_enforces_limit() {
        let mut buf = BytesMut::from(&b"1000    "[..]);
        assert!(matches!(
            decode_message(&mut buf, 16),
            Err(SocketError::PayloadTooLarge { size: 1000, max: 16 })
        ));
    }

    #[test]
    fn back_to_back_messages() {
        let mut buf = BytesMut::new();
        encode_message(b"first", &mut buf).unwrap();
        encode_message(b"", &mut buf).unwrap();
        encode_message(b"third", &mut buf).unwrap();

        let first = decode_message(&mut buf, MAX_PAYLOAD).unwrap().unwrap();
        let empty = decode_message(&mut buf, MAX_PAYLOAD).unwrap().unwrap();
        let third = decode_message(&mut buf, MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(first.as_ref(), b"first");
        assert!(empty.is_empty());
        assert_eq!(third.as_ref(), b"third");
        assert!(buf.is_empty());
    }
}
