//! Length-prefixed framing
//!
//! One frame is a big-endian u32 length followed by that many payload
//! bytes. No alignment, no header flags. Decoding is incremental: a
//! partial frame leaves the buffer untouched until more bytes arrive.

use crate::buffer::ByteBuffer;
use weft_core::{WeftError, WeftResult};

/// Upper bound on a single payload; a length above this is treated as a
/// corrupt stream and fails the connection
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wrap a payload in a frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + payload.len());
    packet.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Try to extract one complete frame from the buffer
///
/// `Ok(Some(payload))` consumes the frame; `Ok(None)` means more bytes
/// are needed; `Err` means the stream is corrupt (pathological length)
/// and the connection must be torn down.
pub fn decode(buffer: &mut ByteBuffer) -> WeftResult<Option<Vec<u8>>> {
    if buffer.readable() < 4 {
        return Ok(None);
    }

    let head = buffer.peek();
    let length = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(WeftError::Decode("frame length exceeds limit"));
    }

    if buffer.readable() < 4 + length {
        return Ok(None);
    }

    buffer.consume(4);
    Ok(Some(buffer.retrieve(length)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_single_frame() {
        let mut buf = ByteBuffer::new();
        buf.append(&encode(b"payload"));
        let out = decode(&mut buf).unwrap().unwrap();
        assert_eq!(out, b"payload");
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_incremental_feed() {
        let packet = encode(b"split across reads");
        let mut buf = ByteBuffer::new();

        buf.append(&packet[..3]);
        assert!(decode(&mut buf).unwrap().is_none());

        buf.append(&packet[3..10]);
        assert!(decode(&mut buf).unwrap().is_none());

        buf.append(&packet[10..]);
        let out = decode(&mut buf).unwrap().unwrap();
        assert_eq!(out, b"split across reads");
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = ByteBuffer::new();
        buf.append(&encode(b"one"));
        buf.append(&encode(b"two"));
        assert_eq!(decode(&mut buf).unwrap().unwrap(), b"one");
        assert_eq!(decode(&mut buf).unwrap().unwrap(), b"two");
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = ByteBuffer::new();
        buf.append(&encode(b""));
        assert_eq!(decode(&mut buf).unwrap().unwrap(), b"");
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = ByteBuffer::new();
        buf.append(&u32::MAX.to_be_bytes());
        buf.append(b"junk");
        assert!(matches!(decode(&mut buf), Err(WeftError::Decode(_))));
    }

    #[test]
    fn test_length_is_big_endian() {
        let packet = encode(b"AB");
        assert_eq!(&packet[..4], &[0, 0, 0, 2]);
    }
}
