//! Decoded frames and contiguous frame builders.
//!
//! Uses `bytes::Bytes` so segments can be handed to loaders without copying.
//!
//! # Example
//!
//! ```
//! use modelwire::protocol::{build_control_frame, Frame, FrameReader};
//!
//! # tokio_test_block(async {
//! let bytes = build_control_frame(&[&b"{}"[..], b"abc", b""]);
//! let mut reader = FrameReader::new(&bytes[..]);
//! let frame = reader.read_frame().await.unwrap().unwrap();
//! assert!(frame.is_control());
//! assert_eq!(frame.segments().len(), 3);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use bytes::Bytes;

use super::wire_format::{
    encode_len, encode_u32, segments_encoded_len, CONTROL_TAG, CONTROL_TERMINATOR, COUNT_SIZE,
    DATA_CHUNK_TAG, DATA_REQUEST_TAG, LENGTH_SIZE,
};

/// A complete inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON invocation in segment 0, raw attachments after it.
    Control { segments: Vec<Bytes> },
    /// Bulk data answering the read registered under `request_id`.
    DataChunk { request_id: u32, segments: Vec<Bytes> },
}

impl Frame {
    /// Check if this is a control frame.
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Control { .. })
    }

    /// Request id of a data-chunk frame.
    #[inline]
    pub fn request_id(&self) -> Option<u32> {
        match self {
            Frame::DataChunk { request_id, .. } => Some(*request_id),
            Frame::Control { .. } => None,
        }
    }

    /// All segments carried by the frame.
    #[inline]
    pub fn segments(&self) -> &[Bytes] {
        match self {
            Frame::Control { segments } | Frame::DataChunk { segments, .. } => segments,
        }
    }

    /// Consume the frame, returning its segments.
    pub fn into_segments(self) -> Vec<Bytes> {
        match self {
            Frame::Control { segments } | Frame::DataChunk { segments, .. } => segments,
        }
    }
}

/// Build a control frame as a single byte vector.
///
/// # Panics
///
/// Panics if `segments` is empty; a control frame always carries its JSON.
pub fn build_control_frame<T: AsRef<[u8]>>(segments: &[T]) -> Vec<u8> {
    assert!(!segments.is_empty(), "control frame needs at least one segment");

    let mut buf = Vec::with_capacity(2 + COUNT_SIZE + segments_encoded_len(segments));
    buf.push(CONTROL_TAG);
    buf.extend_from_slice(&encode_u32((segments.len() - 1) as u32));
    push_segments(&mut buf, segments);
    buf.push(CONTROL_TERMINATOR);
    buf
}

/// Build a data-chunk frame as a single byte vector.
///
/// The subprocess never sends these; the host does. Kept for tests and
/// host-side tooling.
pub fn build_data_chunk_frame<T: AsRef<[u8]>>(request_id: u32, segments: &[T]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 2 * COUNT_SIZE + segments_encoded_len(segments));
    buf.push(DATA_CHUNK_TAG);
    buf.extend_from_slice(&encode_u32(request_id));
    buf.extend_from_slice(&encode_u32(segments.len() as u32));
    push_segments(&mut buf, segments);
    buf
}

/// Build a data-request frame around an already serialized JSON body.
pub fn build_data_request_frame(json: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + LENGTH_SIZE + json.len());
    buf.push(DATA_REQUEST_TAG);
    buf.extend_from_slice(&encode_len(json.len()));
    buf.extend_from_slice(json);
    buf
}

fn push_segments<T: AsRef<[u8]>>(buf: &mut Vec<u8>, segments: &[T]) {
    for segment in segments {
        let segment = segment.as_ref();
        buf.extend_from_slice(&encode_len(segment.len()));
        buf.extend_from_slice(segment);
    }
}
