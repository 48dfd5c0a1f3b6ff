//! Header/body codecs for the proven RPC engine.
//!
//! A connection negotiates one [`CodecType`] during its handshake. After that
//! every exchange is a frame: a [`Header`] followed by exactly one body. The
//! codec is split into a [`CodecReader`] owned by the single reading task and a
//! [`CodecWriter`] shared (behind a lock) by every task that sends frames.
//!
//! Bodies cross the codec boundary as encoded bytes. Values are turned into
//! bodies, and back, with [`CodecType::encode`] and [`CodecType::decode`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod cbor;
mod codec_type;
mod error;
pub mod framing;
mod header;
mod json;

pub use cbor::{CborReader, CborWriter};
pub use codec_type::{CBOR, CodecType, JSON};
pub use error::CodecError;
pub use header::Header;
pub use json::{JsonReader, JsonWriter};

use async_trait::async_trait;
use bytes::Bytes;

/// Reading half of a codec.
#[async_trait]
pub trait CodecReader: Send + 'static {
    /// Reads the next header.
    async fn read_header(&mut self) -> Result<Header, CodecError>;

    /// Reads the body that follows the last header, still encoded.
    async fn read_body(&mut self) -> Result<Bytes, CodecError>;

    /// Reads and drops the body that follows the last header.
    async fn discard_body(&mut self) -> Result<(), CodecError> {
        self.read_body().await.map(drop)
    }
}

/// Writing half of a codec.
#[async_trait]
pub trait CodecWriter: Send + 'static {
    /// Writes one header and its body as a single frame.
    ///
    /// Returns only after the frame has been flushed. On failure the
    /// underlying stream is shut down; a partial frame is never retried.
    async fn write(&mut self, header: &Header, body: Bytes) -> Result<(), CodecError>;

    /// Flushes and shuts down the underlying stream.
    async fn close(&mut self) -> Result<(), CodecError>;
}
