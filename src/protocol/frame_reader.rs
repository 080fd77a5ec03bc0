//! Streaming frame decoder.
//!
//! Reads exactly the bytes a frame declares and nothing more, so the
//! underlying stream may deliver data in arbitrarily small pieces and a
//! frame boundary is never overrun.
//!
//! # Example
//!
//! ```ignore
//! use modelwire::protocol::FrameReader;
//!
//! let mut reader = FrameReader::new(read_half);
//! while let Some(frame) = reader.read_frame().await? {
//!     println!("got frame with {} segments", frame.segments().len());
//! }
//! ```

use std::io::ErrorKind;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::wire_format::{FrameKind, CONTROL_TERMINATOR, MAX_SEGMENT_PREALLOC};
use super::Frame;
use crate::error::{Result, RuntimeError};

/// Decodes frames from an async byte source.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte source.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    /// A stream that ends mid-frame yields [`RuntimeError::ConnectionClosed`].
    /// A control frame with a bad terminator is fully consumed before
    /// [`RuntimeError::Protocol`] is returned, so the caller may keep reading.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let tag = match self.reader.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(RuntimeError::Io(e)),
        };

        let frame = match FrameKind::from_tag(tag) {
            FrameKind::Control => {
                let extra = self.read_u32().await?;
                let count = extra as usize + 1;
                let segments = self.read_segments(count).await?;

                let terminator = self.read_byte().await?;
                if terminator != CONTROL_TERMINATOR {
                    return Err(RuntimeError::Protocol(format!(
                        "Control frame terminator must be 0, got {}",
                        terminator
                    )));
                }

                Frame::Control { segments }
            }
            FrameKind::DataChunk => {
                let request_id = self.read_u32().await?;
                let count = self.read_u32().await? as usize;
                let segments = self.read_segments(count).await?;
                Frame::DataChunk {
                    request_id,
                    segments,
                }
            }
        };

        Ok(Some(frame))
    }

    /// Give back the underlying source.
    pub fn into_inner(self) -> R {
        self.reader
    }

    async fn read_segments(&mut self, count: usize) -> Result<Vec<Bytes>> {
        let mut segments = Vec::with_capacity(count.min(MAX_SEGMENT_PREALLOC));
        for _ in 0..count {
            segments.push(self.read_segment().await?);
        }
        Ok(segments)
    }

    async fn read_segment(&mut self) -> Result<Bytes> {
        let len = self.reader.read_u64().await.map_err(mid_frame)?;
        let len = usize::try_from(len).map_err(|_| {
            RuntimeError::Protocol(format!("Segment length {} does not fit in memory", len))
        })?;

        let mut buf = BytesMut::zeroed(len);
        self.reader.read_exact(&mut buf).await.map_err(mid_frame)?;
        Ok(buf.freeze())
    }

    async fn read_u32(&mut self) -> Result<u32> {
        self.reader.read_u32().await.map_err(mid_frame)
    }

    async fn read_byte(&mut self) -> Result<u8> {
        self.reader.read_u8().await.map_err(mid_frame)
    }
}

fn mid_frame(e: std::io::Error) -> RuntimeError {
    if e.kind() == ErrorKind::UnexpectedEof {
        RuntimeError::ConnectionClosed
    } else {
        RuntimeError::Io(e)
    }
}
