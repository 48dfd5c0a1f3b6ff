use crate::cbor::{CborReader, CborWriter};
use crate::error::CodecError;
use crate::json::{JsonReader, JsonWriter};
use crate::{CodecReader, CodecWriter};

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncWrite};

/// Identifier of the JSON lines codec.
pub const JSON: &str = "application/json";

/// Identifier of the framed CBOR codec.
pub const CBOR: &str = "application/cbor";

/// Codec negotiated for a connection.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum CodecType {
    /// Newline-delimited JSON documents.
    #[default]
    Json,

    /// CBOR payloads in checksummed, length-prefixed frames.
    Cbor,
}

impl CodecType {
    /// Wire identifier of this codec.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => JSON,
            Self::Cbor => CBOR,
        }
    }

    /// Encodes a body value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            Self::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| CodecError::SerializationFailed(e.to_string())),
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(value, &mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Decodes a body value.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    pub fn decode<T: DeserializeOwned>(self, body: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => serde_json::from_slice(body)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
            Self::Cbor => Ok(ciborium::de::from_reader(body)?),
        }
    }

    /// Body sent alongside error responses (an encoded null).
    #[must_use]
    pub fn empty_body(self) -> Bytes {
        match self {
            Self::Json => Bytes::from_static(b"null"),
            Self::Cbor => Bytes::from_static(&[0xf6]),
        }
    }

    /// Builds the reading and writing halves of this codec over `stream`.
    pub fn new_codec<S>(
        self,
        stream: S,
        max_frame_size: usize,
    ) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        match self {
            Self::Json => (
                Box::new(JsonReader::new(read_half, max_frame_size)),
                Box::new(JsonWriter::new(write_half)),
            ),
            Self::Cbor => (
                Box::new(CborReader::new(read_half, max_frame_size)),
                Box::new(CborWriter::new(write_half, max_frame_size)),
            ),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            JSON => Ok(Self::Json),
            CBOR => Ok(Self::Cbor),
            other => Err(CodecError::UnsupportedCodec(other.to_string())),
        }
    }
}

impl Serialize for CodecType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CodecType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
