//! Error types for the RPC engine.

use std::io;
use std::sync::Arc;

use proven_rpc_codec::CodecError;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
///
/// Cloneable: a connection failure is delivered to every pending call.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The client is closing or has been torn down.
    #[error("connection is shut down")]
    Shutdown,

    /// Framing or encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Reply body could not be decoded into the expected type.
    #[error("reading body: {0}")]
    ReplyBody(CodecError),

    /// Option negotiation failed.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// The server reported an error for this call.
    #[error("{0}")]
    Remote(String),

    /// A method with this name is already registered.
    #[error("method already registered: {0}")]
    DuplicateMethod(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Option negotiation errors.
///
/// Any of these aborts the connection before a single frame is exchanged.
#[derive(Clone, Debug, Error)]
pub enum HandshakeError {
    /// Magic number did not match.
    #[error("invalid magic number: {0:#x}")]
    InvalidMagicNumber(u64),

    /// Codec identifier is not known.
    #[error("invalid codec type: {0}")]
    UnsupportedCodec(String),

    /// Options could not be parsed.
    #[error("malformed options: {0}")]
    Malformed(String),

    /// Options exceeded the configured limit without terminating.
    #[error("options exceed {0} bytes")]
    TooLarge(usize),

    /// Transport failed during negotiation.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
