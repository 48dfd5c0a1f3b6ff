//! JSON lines codec.
//!
//! Every header and every body is a single JSON document followed by `\n`.
//! Compact JSON never contains a raw newline, so lines are frames.

use crate::error::CodecError;
use crate::header::Header;
use crate::{CodecReader, CodecWriter};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::warn;

/// Reading half of the JSON codec.
///
/// Lines are decoded from a buffer owned by the reader rather than through
/// `FramedRead`, which ends the stream after any decode error. An overlong
/// line is reported once and then skipped up to its newline.
pub struct JsonReader<R> {
    inner: R,
    buf: BytesMut,
    lines: LinesCodec,
    max_frame_size: usize,
    eof: bool,
}

impl<R: AsyncRead + Send + Unpin + 'static> JsonReader<R> {
    /// Wraps a reader, rejecting lines longer than `max_frame_size`.
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            lines: LinesCodec::new_with_max_length(max_frame_size),
            max_frame_size,
            eof: false,
        }
    }

    async fn next_line(&mut self) -> Result<String, CodecError> {
        loop {
            let decoded = if self.eof {
                self.lines.decode_eof(&mut self.buf)
            } else {
                self.lines.decode(&mut self.buf)
            };

            match decoded {
                Ok(Some(line)) => return Ok(line),
                Ok(None) if self.eof => return Err(CodecError::Closed),
                Ok(None) => {}
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Err(CodecError::InvalidFrame(format!(
                        "line exceeds {} bytes",
                        self.max_frame_size
                    )));
                }
                Err(LinesCodecError::Io(e)) => return Err(e.into()),
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin + 'static> CodecReader for JsonReader<R> {
    async fn read_header(&mut self) -> Result<Header, CodecError> {
        let line = self.next_line().await?;
        serde_json::from_str(&line).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }

    async fn read_body(&mut self) -> Result<Bytes, CodecError> {
        self.next_line().await.map(|line| Bytes::from(line.into_bytes()))
    }
}

/// Writing half of the JSON codec.
pub struct JsonWriter<W> {
    buf: BufWriter<W>,
}

impl<W: AsyncWrite + Send + Unpin + 'static> JsonWriter<W> {
    /// Wraps a writer.
    pub fn new(inner: W) -> Self {
        Self {
            buf: BufWriter::new(inner),
        }
    }

    async fn write_frame(&mut self, header: &Header, body: &[u8]) -> Result<(), CodecError> {
        if body.contains(&b'\n') {
            return Err(CodecError::InvalidFrame(
                "JSON body must not contain a newline".to_string(),
            ));
        }

        let mut line = serde_json::to_vec(header)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        line.push(b'\n');

        self.buf.write_all(&line).await?;
        self.buf.write_all(body).await?;
        self.buf.write_all(b"\n").await?;
        self.buf.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin + 'static> CodecWriter for JsonWriter<W> {
    async fn write(&mut self, header: &Header, body: Bytes) -> Result<(), CodecError> {
        let result = self.write_frame(header, &body).await;

        if let Err(e) = &result {
            warn!("rpc codec: json error writing frame: {}", e);
            let _ = self.buf.shutdown().await;
        }

        result
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.buf.shutdown().await.map_err(Into::into)
    }
}
