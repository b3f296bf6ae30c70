//! Shared helpers for the integration tests

#![allow(dead_code)]

use remotemedia_buffer_queue::{DataChunk, StreamItem};

/// Install a test-friendly tracing subscriber once per binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("remotemedia_buffer_queue=debug")
        .with_test_writer()
        .try_init();
}

/// Byte expected at a logical stream offset
pub fn byte_at(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Payload covering `[offset, offset + len)` of the reference stream
pub fn stream_bytes(offset: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| byte_at(offset + i)).collect()
}

/// Data item for `[offset, offset + len)` of the reference stream
pub fn stream_chunk(offset: u64, len: usize) -> StreamItem {
    StreamItem::Data(DataChunk::new(stream_bytes(offset, len)))
}

/// Chunk where every byte is `value`
pub fn filled(value: u8, len: usize) -> StreamItem {
    StreamItem::data(vec![value; len])
}
