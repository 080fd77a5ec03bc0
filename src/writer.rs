//! Dedicated writer task: the only path back to the host.
//!
//! Every handler, loader and tracker sends whole frames through a cloneable
//! [`WriterHandle`]; a single task owns the socket write half and writes
//! frames one after another, so bytes of two frames never interleave.
//!
//! # Architecture
//!
//! ```text
//! Handler 1 ─┐
//! Loader    ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Tracker   ─┘
//! ```
//!
//! A write or flush error ends the task with [`RuntimeError::Transport`];
//! the runtime treats that as fatal for the whole session.

use std::io::IoSlice;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, RuntimeError};
use crate::protocol::{
    COUNT_SIZE, CONTROL_TAG, CONTROL_TERMINATOR, DATA_REQUEST_TAG, LENGTH_SIZE,
};

/// Frames queued toward the host before senders start waiting.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on frames coalesced into one vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written, split into parts for vectored I/O.
///
/// Small prefix parts (tags, counts, lengths) alternate with segment
/// payloads, which are never copied.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    parts: Vec<Bytes>,
}

impl OutboundFrame {
    /// Create a control frame: JSON in segment 0, attachments after it.
    pub fn control(json: Bytes, attachments: Vec<Bytes>) -> Self {
        let count = attachments.len() + 1;
        let mut parts = Vec::with_capacity(count * 2 + 1);
        let mut head = BytesMut::with_capacity(1 + COUNT_SIZE + LENGTH_SIZE);
        head.put_u8(CONTROL_TAG);
        head.put_u32((count - 1) as u32);

        for segment in std::iter::once(json).chain(attachments) {
            head.put_u64(segment.len() as u64);
            parts.push(head.split().freeze());
            if !segment.is_empty() {
                parts.push(segment);
            }
        }

        head.put_u8(CONTROL_TERMINATOR);
        parts.push(head.freeze());

        Self { parts }
    }

    /// Create a data-request frame around a serialized JSON body.
    pub fn data_request(json: Bytes) -> Self {
        let mut head = BytesMut::with_capacity(1 + LENGTH_SIZE);
        head.put_u8(DATA_REQUEST_TAG);
        head.put_u64(json.len() as u64);
        Self {
            parts: vec![head.freeze(), json],
        }
    }

    /// Total size of this frame in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    /// Copy the frame into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        for part in &self.parts {
            buf.extend_from_slice(part);
        }
        buf
    }
}

/// Writer task settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue. Senders wait when it is full.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Cloneable sender side of the host connection.
///
/// This is cheaply cloneable and can be shared across all call tasks.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// Fails with [`RuntimeError::ConnectionClosed`] once the writer task
    /// has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RuntimeError::ConnectionClosed)
    }

    /// Check whether the writer task is gone.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the writer task on `writer`.
///
/// The task finishes with `Ok(())` once every handle is dropped, or with
/// [`RuntimeError::Transport`] on the first failed write or flush.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// [`spawn_writer_task`] with [`WriterConfig::default`].
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => return Ok(()),
        };

        // Drain whatever else is already queued.
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("Write to host failed: {}", e);
            return Err(RuntimeError::Transport(e));
        }
    }
}

/// Write a batch of whole frames with scatter/gather I/O, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::new();
    let mut offset = 0;

    for part in batch.iter().flat_map(|f| f.parts.iter()) {
        let end = offset + part.len();
        if skip_bytes < end && !part.is_empty() {
            let start_in_part = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&part[start_in_part..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_control_frame, build_data_request_frame, FrameReader};
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_control_frame_matches_contiguous_builder() {
        let frame = OutboundFrame::control(
            Bytes::from_static(b"{}"),
            vec![Bytes::from_static(b"abc"), Bytes::new()],
        );
        let expected = build_control_frame(&[&b"{}"[..], b"abc", b""]);

        assert_eq!(frame.to_vec(), expected);
        assert_eq!(frame.size(), expected.len());
    }

    #[test]
    fn test_data_request_matches_contiguous_builder() {
        let frame = OutboundFrame::data_request(Bytes::from_static(b"{\"x\":1}"));
        assert_eq!(frame.to_vec(), build_data_request_frame(b"{\"x\":1}"));
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_build_remaining_slices_partial_prefix() {
        let frame = OutboundFrame::control(Bytes::from_static(b"hello"), vec![]);
        let batch = vec![frame];

        // Prefix is tag + count + len = 13 bytes, then "hello", then terminator.
        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), 8);
        assert_eq!(slices[1].len(), 5);
        assert_eq!(slices[2].len(), 1);

        let slices = build_remaining_slices(&batch, 13 + 2);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"llo");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5)
            .map(|_| OutboundFrame::control(Bytes::from_static(b"{}"), vec![]))
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();

        let written = buf.into_inner();
        assert_eq!(written.len(), 5 * batch[0].size());
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (client, server) = duplex(64);
        let (handle, _task) = spawn_writer_task_default(client);

        let mut senders = Vec::new();
        for i in 0..8u8 {
            let handle = handle.clone();
            senders.push(tokio::spawn(async move {
                let body = Bytes::from(vec![i; 300]);
                handle
                    .send(OutboundFrame::control(Bytes::from_static(b"{}"), vec![body]))
                    .await
                    .unwrap();
            }));
        }

        let mut reader = FrameReader::new(server);
        let mut seen = Vec::new();
        for _ in 0..8 {
            let frame = reader.read_frame().await.unwrap().unwrap();
            let body = &frame.segments()[1];
            assert_eq!(body.len(), 300);
            assert!(body.iter().all(|b| *b == body[0]));
            seen.push(body[0]);
        }
        for s in senders {
            s.await.unwrap();
        }

        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "gone",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_transport_error() {
        let (handle, task) = spawn_writer_task_default(FailingWriter);

        handle
            .send(OutboundFrame::control(Bytes::from_static(b"{}"), vec![]))
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RuntimeError::Transport(_))));

        // Later sends see a closed connection.
        let again = handle
            .send(OutboundFrame::control(Bytes::from_static(b"{}"), vec![]))
            .await;
        assert!(matches!(again, Err(RuntimeError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_frame_reaches_peer_intact() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        let frame = OutboundFrame::data_request(Bytes::from_static(b"{}"));
        let expected = frame.to_vec();
        handle.send(frame).await.unwrap();

        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }
}
