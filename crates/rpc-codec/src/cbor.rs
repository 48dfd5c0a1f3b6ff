//! CBOR codec over checksummed frames.

use crate::error::CodecError;
use crate::framing::{Frame, FrameCodec, FrameKind};
use crate::header::Header;
use crate::{CodecReader, CodecWriter};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::warn;

/// Reading half of the CBOR codec.
pub struct CborReader<R> {
    frames: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Send + Unpin + 'static> CborReader<R> {
    /// Wraps a reader, rejecting frames larger than `max_frame_size`.
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            frames: FramedRead::new(
                inner,
                FrameCodec::new().with_max_frame_size(max_frame_size),
            ),
        }
    }

    async fn next_frame(&mut self, kind: FrameKind) -> Result<Frame, CodecError> {
        let frame = self.frames.next().await.ok_or(CodecError::Closed)??;
        let frame = frame.expect(kind)?;
        frame.verify_checksum()?;
        Ok(frame)
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin + 'static> CodecReader for CborReader<R> {
    async fn read_header(&mut self) -> Result<Header, CodecError> {
        let frame = self.next_frame(FrameKind::Header).await?;
        Ok(ciborium::de::from_reader(&frame.payload[..])?)
    }

    async fn read_body(&mut self) -> Result<Bytes, CodecError> {
        self.next_frame(FrameKind::Body)
            .await
            .map(|frame| frame.payload)
    }
}

/// Writing half of the CBOR codec.
pub struct CborWriter<W> {
    frames: FramedWrite<W, FrameCodec>,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Send + Unpin + 'static> CborWriter<W> {
    /// Wraps a writer, rejecting frames larger than `max_frame_size`.
    pub fn new(inner: W, max_frame_size: usize) -> Self {
        Self {
            frames: FramedWrite::new(
                inner,
                FrameCodec::new().with_max_frame_size(max_frame_size),
            ),
            max_frame_size,
        }
    }

    async fn write_frame(&mut self, header: &Header, body: Bytes) -> Result<(), CodecError> {
        let mut encoded = Vec::new();
        ciborium::ser::into_writer(header, &mut encoded)?;

        // Both parts are checked up front so a rejected body never leaves an
        // orphaned header in the write buffer.
        for size in [encoded.len(), body.len()] {
            if size > self.max_frame_size {
                return Err(CodecError::FrameTooLarge {
                    size,
                    max: self.max_frame_size,
                });
            }
        }

        self.frames
            .feed(Frame::new(FrameKind::Header, Bytes::from(encoded)))
            .await?;
        self.frames.feed(Frame::new(FrameKind::Body, body)).await?;
        self.frames.flush().await
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin + 'static> CodecWriter for CborWriter<W> {
    async fn write(&mut self, header: &Header, body: Bytes) -> Result<(), CodecError> {
        let result = self.write_frame(header, body).await;

        if let Err(e) = &result {
            warn!("rpc codec: cbor error writing frame: {}", e);
            let _ = SinkExt::<Frame>::close(&mut self.frames).await;
        }

        result
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        SinkExt::<Frame>::close(&mut self.frames).await
    }
}
