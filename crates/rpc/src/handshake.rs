//! Option negotiation performed once per connection.
//!
//! The initiator writes a single JSON object terminated by `\n` before any
//! frame. The responder validates the magic number first and the codec type
//! second; either failure aborts the connection without a reply.

use crate::error::HandshakeError;

use proven_rpc_codec::CodecType;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Marks a connection as speaking this protocol.
pub const MAGIC_NUMBER: u64 = 0xffff_7777;

/// Default upper bound on the size of the encoded options.
pub const MAX_OPTIONS_SIZE: usize = 1024;

/// Options fixed for the lifetime of a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    /// Protocol marker, always [`MAGIC_NUMBER`] for well-behaved peers.
    pub magic_number: u64,

    /// Codec used for every frame after the handshake.
    pub codec_type: CodecType,
}

impl Options {
    /// Options selecting `codec_type`.
    #[must_use]
    pub const fn new(codec_type: CodecType) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new(CodecType::default())
    }
}

/// Options as they appear on the wire, before validation.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireOptions {
    magic_number: u64,
    codec_type: String,
}

/// Writes `options` as the opening bytes of a connection.
///
/// # Errors
///
/// Returns an error if the transport fails.
pub async fn write_options<W>(writer: &mut W, options: &Options) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let mut line =
        serde_json::to_vec(options).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    line.push(b'\n');

    writer.write_all(&line).await?;
    writer.flush().await?;

    Ok(())
}

/// Reads and validates the options opening a connection.
///
/// Reads one byte at a time so nothing past the terminating newline is
/// consumed before the codec takes over the stream.
///
/// # Errors
///
/// Returns an error if the transport fails, the options are malformed or too
/// large, the magic number is wrong, or the codec type is unknown.
pub async fn read_options<R>(reader: &mut R, max_size: usize) -> Result<Options, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);

    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= max_size {
            return Err(HandshakeError::TooLarge(max_size));
        }
        line.push(byte);
    }

    parse_options(&line)
}

/// Validates encoded options.
///
/// # Errors
///
/// Returns an error if the options are malformed, the magic number is wrong,
/// or the codec type is unknown.
pub fn parse_options(encoded: &[u8]) -> Result<Options, HandshakeError> {
    let wire: WireOptions =
        serde_json::from_slice(encoded).map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    if wire.magic_number != MAGIC_NUMBER {
        return Err(HandshakeError::InvalidMagicNumber(wire.magic_number));
    }

    let codec_type = wire
        .codec_type
        .parse()
        .map_err(|_| HandshakeError::UnsupportedCodec(wire.codec_type))?;

    Ok(Options {
        magic_number: wire.magic_number,
        codec_type,
    })
}
