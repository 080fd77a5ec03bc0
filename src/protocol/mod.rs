//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol spoken with the host:
//! - Tag bytes and fixed-width big-endian integers
//! - Contiguous frame builders
//! - A streaming decoder that reads exactly what each frame declares

mod frame;
mod frame_reader;
mod wire_format;

pub use frame::{build_control_frame, build_data_chunk_frame, build_data_request_frame, Frame};
pub use frame_reader::FrameReader;
pub use wire_format::{
    encode_len, encode_u32, segments_encoded_len, FrameKind, CONTROL_TAG, CONTROL_TERMINATOR,
    COUNT_SIZE, DATA_CHUNK_TAG, DATA_REQUEST_TAG, LENGTH_SIZE, MAX_SEGMENT_PREALLOC,
};
