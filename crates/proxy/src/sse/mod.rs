//! SSE bridge: ordered reassembly of chunk envelopes and re-streaming
//! to HTTP clients, plus consumption of upstream agent event streams.

pub mod egress;
pub mod reassembly;
pub mod upstream;

use courier_bus::{ChunkPayload, StreamMetadata};

/// One reassembled stream chunk, ready for egress.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub sequence: u64,
    pub payload: ChunkPayload,
    pub metadata: StreamMetadata,
}

/// What the ordered per-stream channel carries to the HTTP writer.
#[derive(Debug)]
pub enum StreamEvent {
    /// An in-order chunk to render as one SSE event.
    Chunk(StreamChunk),
    /// Terminal failure, rendered as an `error` SSE event before close.
    Error { code: i64, message: String },
    /// Clean end of stream; produces no bytes, closes the response.
    End,
}
