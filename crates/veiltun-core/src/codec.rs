//! Obfuscation Codec
//!
//! Wraps a single message into a length-prefixed, padded, XOR-obfuscated
//! wire frame and back.
//!
//! # Frame Layout
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────────────┐
//! │ len (u16 BE) │ XOR( padding[n] ‖ payload ‖ n ) with repeating key │
//! └──────────────┴───────────────────────────────────────────────────┘
//! ```
//!
//! The length prefix is sent in the clear. The trailing padding-length byte
//! is obfuscated together with the rest of the body.
//!
//! Padding is a traffic-shape randomizer, not a security boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

/// Size of the clear-text length prefix
pub const HEADER_LEN: usize = 2;

/// Default upper bound for random padding
pub const DEFAULT_MAX_PADDING: u8 = 128;

/// Largest body a single frame can carry
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Obfuscation key must not be empty")]
    EmptyKey,

    #[error("Frame too large ({0} bytes, maximum {MAX_BODY_LEN})")]
    FrameTooLarge(usize),

    #[error("Frame body is empty")]
    EmptyBody,

    #[error("Padding length {padding} does not fit in a {body_len}-byte body")]
    Framing { padding: usize, body_len: usize },
}

/// Repeating-key XOR obfuscator with random padding
#[derive(Clone)]
pub struct Obfuscator {
    key: Vec<u8>,
    max_padding: u8,
}

impl Obfuscator {
    /// Create a new obfuscator
    pub fn new(key: impl Into<Vec<u8>>, max_padding: u8) -> Result<Self, CodecError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CodecError::EmptyKey);
        }
        Ok(Self { key, max_padding })
    }

    /// Upper bound (inclusive) of the random padding draw
    pub fn max_padding(&self) -> u8 {
        self.max_padding
    }

    /// Encode a payload with a padding length drawn from `[0, max_padding]`
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let padding = rand::thread_rng().gen_range(0..=self.max_padding);
        self.encode_with_padding(payload, padding)
    }

    /// Encode a payload with a fixed padding length
    ///
    /// Returns the full wire representation (length prefix + body).
    pub fn encode_with_padding(&self, payload: &[u8], padding: u8) -> Result<Bytes, CodecError> {
        let pad = padding as usize;
        let body_len = pad + payload.len() + 1;
        if body_len > MAX_BODY_LEN {
            return Err(CodecError::FrameTooLarge(body_len));
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + body_len);
        frame.put_u16(body_len as u16);
        frame.resize(HEADER_LEN + pad, 0);
        rand::thread_rng().fill(&mut frame[HEADER_LEN..]);
        frame.put_slice(payload);
        frame.put_u8(padding);

        self.apply(&mut frame[HEADER_LEN..]);
        Ok(frame.freeze())
    }

    /// Decode an obfuscated body (without its length prefix)
    pub fn decode(&self, body: &[u8]) -> Result<Bytes, CodecError> {
        let mut plain = BytesMut::from(body);
        self.decode_in_place(&mut plain)?;
        Ok(plain.freeze())
    }

    /// Decode an obfuscated body in place, leaving only the payload
    pub fn decode_in_place(&self, body: &mut BytesMut) -> Result<(), CodecError> {
        if body.is_empty() {
            return Err(CodecError::EmptyBody);
        }

        self.apply(body);

        let body_len = body.len();
        let padding = body[body_len - 1] as usize;
        if padding >= body_len {
            return Err(CodecError::Framing { padding, body_len });
        }

        body.truncate(body_len - 1);
        body.advance(padding);
        Ok(())
    }

    /// XOR `data` with the repeating key. Symmetric.
    fn apply(&self, data: &mut [u8]) {
        for (byte, key) in data.iter_mut().zip(self.key.iter().cycle()) {
            *byte ^= key;
        }
    }
}

impl std::fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obfuscator")
            .field("key", &"[redacted]")
            .field("max_padding", &self.max_padding)
            .finish()
    }
}

/// Receive-side reassembly buffer
///
/// Bytes arrive in arbitrary chunks. Complete frames are extracted in order;
/// an incomplete trailing frame stays buffered, header included, until more
/// bytes arrive.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    /// Append received bytes
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Buffered byte count
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Is the buffer empty?
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the next complete frame body, if fully buffered
    pub fn next_frame(&mut self) -> Option<BytesMut> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let body_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() - HEADER_LEN < body_len {
            return None;
        }

        self.buf.advance(HEADER_LEN);
        Some(self.buf.split_to(body_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obfuscator() -> Obfuscator {
        Obfuscator::new(b"k3y-material".to_vec(), DEFAULT_MAX_PADDING).unwrap()
    }

    #[test]
    fn test_empty_key_rejected() {
        assert_eq!(Obfuscator::new(Vec::new(), 128).unwrap_err(), CodecError::EmptyKey);
    }

    #[test]
    fn test_roundtrip_padding_bounds() {
        let payload = b"\x45\x00\x00\x1c some ip packet";

        for key_len in [1usize, 3, 13, 32] {
            let key: Vec<u8> = (0..key_len).map(|i| (i as u8).wrapping_mul(37).wrapping_add(11)).collect();
            let obfs = Obfuscator::new(key, DEFAULT_MAX_PADDING).unwrap();

            for padding in [0u8, 1, 64, 128, 255] {
                let frame = obfs.encode_with_padding(payload, padding).unwrap();
                let body = &frame[HEADER_LEN..];
                assert_eq!(body.len(), padding as usize + payload.len() + 1);
                assert_eq!(&obfs.decode(body).unwrap()[..], &payload[..], "key {key_len}, padding {padding}");
            }
        }
    }

    #[test]
    fn test_random_padding_in_range() {
        let obfs = Obfuscator::new(b"k".to_vec(), 4).unwrap();
        for _ in 0..64 {
            let frame = obfs.encode(b"abc").unwrap();
            let body_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
            assert_eq!(body_len, frame.len() - HEADER_LEN);
            assert!((4..=8).contains(&body_len));
            assert_eq!(&obfs.decode(&frame[HEADER_LEN..]).unwrap()[..], b"abc");
        }
    }

    #[test]
    fn test_wire_layout() {
        let obfs = Obfuscator::new(vec![0xFF], 0).unwrap();
        let frame = obfs.encode_with_padding(&[0x01, 0x02], 0).unwrap();

        // prefix in the clear, body and padding byte XORed
        assert_eq!(&frame[..], &[0x00, 0x03, 0xFE, 0xFD, 0xFF]);
    }

    #[test]
    fn test_key_applied_cyclically() {
        let obfs = Obfuscator::new(vec![0x01, 0x02], 0).unwrap();
        let frame = obfs.encode_with_padding(&[0, 0, 0, 0], 0).unwrap();
        assert_eq!(&frame[HEADER_LEN..], &[0x01, 0x02, 0x01, 0x02, 0x01]);
    }

    #[test]
    fn test_empty_payload() {
        let obfs = obfuscator();
        let frame = obfs.encode_with_padding(&[], 7).unwrap();
        assert!(obfs.decode(&frame[HEADER_LEN..]).unwrap().is_empty());
    }

    #[test]
    fn test_frame_too_large() {
        let obfs = obfuscator();
        let payload = vec![0u8; MAX_BODY_LEN];
        assert!(matches!(
            obfs.encode_with_padding(&payload, 0),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_framing_error() {
        let obfs = Obfuscator::new(vec![0x00], 0).unwrap();
        // last byte claims 9 bytes of padding in a 3-byte body
        let err = obfs.decode(&[0xAA, 0xBB, 0x09]).unwrap_err();
        assert_eq!(err, CodecError::Framing { padding: 9, body_len: 3 });

        // padding equal to the body length is also invalid
        assert!(obfs.decode(&[0xAA, 0xBB, 0x03]).is_err());
        assert_eq!(obfs.decode(&[]).unwrap_err(), CodecError::EmptyBody);
    }

    #[test]
    fn test_truncated_frame_not_extracted() {
        let obfs = obfuscator();
        let frame = obfs.encode_with_padding(b"payload", 10).unwrap();

        let mut buffer = FrameBuffer::new();
        buffer.extend(&frame[..frame.len() - 1]);
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.len(), frame.len() - 1);

        buffer.extend(&frame[frame.len() - 1..]);
        let body = buffer.next_frame().unwrap();
        assert_eq!(&obfs.decode(&body).unwrap()[..], b"payload");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_split_at_every_offset() {
        let obfs = obfuscator();
        let frame = obfs.encode_with_padding(b"split me anywhere", 3).unwrap();

        for split in 0..=frame.len() {
            let mut buffer = FrameBuffer::new();
            let mut out = Vec::new();

            buffer.extend(&frame[..split]);
            while let Some(body) = buffer.next_frame() {
                out.push(obfs.decode(&body).unwrap());
            }
            buffer.extend(&frame[split..]);
            while let Some(body) = buffer.next_frame() {
                out.push(obfs.decode(&body).unwrap());
            }

            assert_eq!(out.len(), 1, "split at {}", split);
            assert_eq!(&out[0][..], b"split me anywhere");
        }
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let obfs = obfuscator();
        let mut stream = Vec::new();
        for i in 0..5u8 {
            stream.extend_from_slice(&obfs.encode(&[i; 20]).unwrap());
        }
        let tail = obfs.encode_with_padding(b"tail", 0).unwrap();
        stream.extend_from_slice(&tail[..3]);

        let mut buffer = FrameBuffer::new();
        buffer.extend(&stream);

        let mut count = 0u8;
        while let Some(body) = buffer.next_frame() {
            assert_eq!(&obfs.decode(&body).unwrap()[..], &[count; 20]);
            count += 1;
        }
        assert_eq!(count, 5);
        assert_eq!(buffer.len(), 3);
    }
}
