//! Consumption of a local agent's `text/event-stream` response.
//!
//! The background request receiver reads the agent's SSE frames here and
//! republishes them as chunk envelopes. Parsing is delegated to
//! `sse-stream` over the response's byte stream.

use futures::{Stream, StreamExt, TryStreamExt};
use sse_stream::{Sse, SseStream};

use courier_bus::{ChunkPayload, ChunkType, StreamMetadata};

/// Parsed SSE frames from an upstream response body.
pub fn frames(
    response: reqwest::Response,
) -> impl Stream<Item = Result<Sse, sse_stream::Error>> + Send + Unpin {
    let bytes = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    SseStream::from_byte_stream(bytes).boxed()
}

/// Map one upstream frame to the chunk payload and metadata it will be
/// published with. `error` events are classified so the requesting side
/// can surface them distinctly.
pub fn chunk_for_frame(frame: &Sse, stream_id: &str) -> (ChunkPayload, StreamMetadata) {
    let chunk_type = match frame.event.as_deref() {
        Some("error") => ChunkType::Error,
        Some(_) => ChunkType::Event,
        None => ChunkType::Data,
    };
    let payload = ChunkPayload {
        data: frame.data.clone(),
        event: frame.event.clone(),
        id: frame.id.clone(),
        retry: frame.retry,
    };
    let metadata = StreamMetadata {
        stream_id: stream_id.to_string(),
        chunk_type,
        event_name: frame.event.clone(),
        retry: frame.retry,
        last_event_id: frame.id.clone(),
        is_final: false,
    };
    (payload, metadata)
}

/// Metadata for the terminal chunk closing a stream.
pub fn end_metadata(stream_id: &str) -> StreamMetadata {
    StreamMetadata {
        stream_id: stream_id.to_string(),
        chunk_type: ChunkType::End,
        event_name: None,
        retry: None,
        last_event_id: None,
        is_final: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Option<&str>, event: Option<&str>, id: Option<&str>, retry: Option<u64>) -> Sse {
        let mut sse = Sse::default();
        sse.data = data.map(str::to_string);
        sse.event = event.map(str::to_string);
        sse.id = id.map(str::to_string);
        sse.retry = retry;
        sse
    }

    #[test]
    fn test_plain_data_frame() {
        let (payload, metadata) = chunk_for_frame(&frame(Some("A"), None, None, None), "s1");
        assert_eq!(payload.data.as_deref(), Some("A"));
        assert_eq!(metadata.chunk_type, ChunkType::Data);
        assert_eq!(metadata.stream_id, "s1");
        assert!(!metadata.is_final);
    }

    #[test]
    fn test_named_event_frame() {
        let (payload, metadata) = chunk_for_frame(
            &frame(Some("{}"), Some("task-update"), Some("7"), Some(2000)),
            "s1",
        );
        assert_eq!(metadata.chunk_type, ChunkType::Event);
        assert_eq!(metadata.event_name.as_deref(), Some("task-update"));
        assert_eq!(metadata.last_event_id.as_deref(), Some("7"));
        assert_eq!(metadata.retry, Some(2000));
        assert_eq!(payload.retry, Some(2000));
    }

    #[test]
    fn test_error_event_classified() {
        let (_, metadata) = chunk_for_frame(&frame(Some("boom"), Some("error"), None, None), "s1");
        assert_eq!(metadata.chunk_type, ChunkType::Error);
    }

    #[test]
    fn test_end_metadata_is_terminal() {
        let metadata = end_metadata("s1");
        assert_eq!(metadata.chunk_type, ChunkType::End);
        assert!(metadata.is_final);
    }
}
