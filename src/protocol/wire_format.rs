//! Wire format constants and fixed-width integer helpers.
//!
//! Two frame shapes travel host → subprocess, distinguished by the first byte:
//! ```text
//! Control:    ┌─────┬───────────┬──────────────────────────┬─────┐
//!             │ 0x00│ count - 1 │ (len u64, bytes) × count │ 0x00│
//!             │ 1 B │ u32 BE    │                          │ 1 B │
//!             └─────┴───────────┴──────────────────────────┴─────┘
//!
//! Data chunk: ┌─────┬────────────┬──────────┬──────────────────────────┐
//!             │ ≠ 0 │ request id │ count    │ (len u64, bytes) × count │
//!             │ 1 B │ u32 BE     │ u32 BE   │                          │
//!             └─────┴────────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Subprocess → host uses the control shape plus a data-request frame:
//! ```text
//! Data request: ┌─────┬───────────┬──────┐
//!               │ 0x01│ len u64 BE│ JSON │
//!               └─────┴───────────┴──────┘
//! ```
//!
//! All multi-byte integers are Big Endian. No padding.

/// Tag byte of a control frame.
pub const CONTROL_TAG: u8 = 0;

/// Tag byte used when encoding data-chunk frames. Any non-zero tag decodes
/// as a data chunk.
pub const DATA_CHUNK_TAG: u8 = 1;

/// Tag byte of an outbound data-request frame.
pub const DATA_REQUEST_TAG: u8 = 1;

/// Trailing sentinel of a control frame.
pub const CONTROL_TERMINATOR: u8 = 0;

/// Width of segment counts and request ids.
pub const COUNT_SIZE: usize = 4;

/// Width of segment length prefixes.
pub const LENGTH_SIZE: usize = 8;

/// Upper bound on segment-vector preallocation while decoding. The count
/// field is untrusted until the segments actually arrive.
pub const MAX_SEGMENT_PREALLOC: usize = 64;

/// Kind of frame announced by a tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// JSON + attachments.
    Control,
    /// Resolution of an outstanding read.
    DataChunk,
}

impl FrameKind {
    /// Classify a tag byte.
    #[inline]
    pub fn from_tag(tag: u8) -> Self {
        if tag == CONTROL_TAG {
            FrameKind::Control
        } else {
            FrameKind::DataChunk
        }
    }
}

/// Encode a u32 as 4 big-endian bytes.
#[inline]
pub fn encode_u32(value: u32) -> [u8; COUNT_SIZE] {
    value.to_be_bytes()
}

/// Encode a segment length as 8 big-endian bytes.
#[inline]
pub fn encode_len(len: usize) -> [u8; LENGTH_SIZE] {
    (len as u64).to_be_bytes()
}

/// Size of the length-prefixed encoding of `segments`.
#[inline]
pub fn segments_encoded_len<T: AsRef<[u8]>>(segments: &[T]) -> usize {
    segments
        .iter()
        .map(|s| LENGTH_SIZE + s.as_ref().len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_from_tag() {
        assert_eq!(FrameKind::from_tag(0), FrameKind::Control);
        assert_eq!(FrameKind::from_tag(1), FrameKind::DataChunk);
        assert_eq!(FrameKind::from_tag(0xFF), FrameKind::DataChunk);
    }

    #[test]
    fn test_big_endian_byte_order() {
        assert_eq!(encode_u32(0x01020304), [1, 2, 3, 4]);
        assert_eq!(encode_len(0x0102), [0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_segments_encoded_len() {
        let segments: [&[u8]; 3] = [b"{}", b"abc", b""];
        assert_eq!(segments_encoded_len(&segments), 3 * LENGTH_SIZE + 5);
    }
}
