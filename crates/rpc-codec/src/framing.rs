//! Length-prefixed framing used by the CBOR codec.
//!
//! Each frame is `length (u32) | kind (u8) | crc32 (u32) | payload`. Checksums
//! are verified by the reader rather than the decoder, so a corrupt payload
//! fails only the read that asked for it and leaves the stream aligned on the
//! next frame.

use crate::error::CodecError;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame prefix size (4 bytes length + 1 byte kind + 4 bytes checksum).
pub const FRAME_PREFIX_SIZE: usize = 9;

/// Kind of frame being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Encoded [`Header`](crate::Header).
    Header = 0x01,
    /// Encoded body following a header.
    Body = 0x02,
}

impl FrameKind {
    /// Human readable name, used in errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Body => "body",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(Self::Header),
            0x02 => Ok(Self::Body),
            _ => Err(CodecError::InvalidFrame(format!(
                "unknown frame kind: {value:#x}"
            ))),
        }
    }
}

/// A single frame on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Kind of this frame.
    pub kind: FrameKind,
    /// Frame payload.
    pub payload: Bytes,
    /// Checksum carried by the frame.
    pub checksum: u32,
}

impl Frame {
    /// Create a new frame, computing its checksum.
    #[must_use]
    pub fn new(kind: FrameKind, payload: Bytes) -> Self {
        let checksum = crc32fast::hash(&payload);
        Self {
            kind,
            payload,
            checksum,
        }
    }

    /// Verify the payload against the carried checksum.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ChecksumMismatch`] if the payload was corrupted.
    pub fn verify_checksum(&self) -> Result<(), CodecError> {
        let actual = crc32fast::hash(&self.payload);
        if self.checksum != actual {
            return Err(CodecError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Check the frame kind, returning the frame if it matches.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedFrame`] on mismatch.
    pub fn expect(self, kind: FrameKind) -> Result<Self, CodecError> {
        if self.kind != kind {
            return Err(CodecError::UnexpectedFrame {
                expected: kind.name(),
                actual: self.kind.name(),
            });
        }
        Ok(self)
    }
}

/// `tokio_util` codec for [`Frame`]s.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the prefix without consuming it
        let mut prefix = &buf[..FRAME_PREFIX_SIZE];
        let payload_len = prefix.get_u32() as usize;
        let kind_byte = prefix.get_u8();
        let checksum = prefix.get_u32();

        if payload_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let frame_len = FRAME_PREFIX_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let kind = FrameKind::try_from(kind_byte)?;

        buf.advance(FRAME_PREFIX_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            kind,
            payload,
            checksum,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();

        if payload_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        buf.reserve(FRAME_PREFIX_SIZE + payload_len);

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload_len as u32);
        buf.put_u8(frame.kind as u8);
        buf.put_u32(frame.checksum);
        buf.put(frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32(100);
        buf.put_u8(FrameKind::Header as u8);
        // Missing checksum and payload

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_is_decoded_but_fails_verification() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let payload = b"Hello, World!";
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload.len() as u32);
        buf.put_u8(FrameKind::Body as u8);
        buf.put_u32(12345);
        buf.put_slice(payload);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert!(matches!(
            frame.verify_checksum(),
            Err(CodecError::ChecksumMismatch { expected: 12345, .. })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(4);
        let mut buf = BytesMut::new();

        let frame = Frame::new(FrameKind::Body, Bytes::from_static(b"too long"));
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(CodecError::FrameTooLarge { size: 8, max: 4 })
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32(0);
        buf.put_u8(0x7f);
        buf.put_u32(0);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_expect_kind() {
        let frame = Frame::new(FrameKind::Body, Bytes::new());
        assert!(matches!(
            frame.expect(FrameKind::Header),
            Err(CodecError::UnexpectedFrame {
                expected: "header",
                actual: "body"
            })
        ));
    }
}
