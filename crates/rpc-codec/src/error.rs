//! Error types for header/body codecs.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while reading or writing frames.
///
/// Cloneable so that a single transport failure can be handed to every
/// in-flight call on the connection.
#[derive(Clone, Debug, Error)]
pub enum CodecError {
    /// The peer closed the stream at a frame boundary.
    #[error("connection closed")]
    Closed,

    /// Underlying transport failure.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Frame exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame could not be parsed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A header arrived where a body was expected, or vice versa.
    #[error("unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame {
        /// Expected frame kind.
        expected: &'static str,
        /// Actual frame kind received.
        actual: &'static str,
    },

    /// Payload checksum did not match.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// Serialization failed.
    #[error("failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Codec identifier is not known.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
}

impl CodecError {
    /// Whether this error is a clean end-of-stream rather than a failure.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            return Self::Io(Arc::new(err.into()));
        }
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
