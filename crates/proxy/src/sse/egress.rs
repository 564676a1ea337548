//! Egress re-streaming: ordered stream events rendered as
//! `text/event-stream` to the waiting HTTP client.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};

use courier_bus::ChunkType;
use courier_common::CorrelationId;

use crate::errors::CORRELATION_HEADER;
use crate::jsonrpc;
use crate::pending::StreamWaiter;
use crate::sse::{StreamChunk, StreamEvent};

/// Keep-alive comment interval on egress streams.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// The SSE fields one chunk renders to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RenderedEvent {
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    data: String,
}

impl RenderedEvent {
    fn into_event(self) -> Event {
        let mut out = Event::default();
        if let Some(name) = self.event {
            out = out.event(name);
        }
        if let Some(id) = self.id {
            out = out.id(id);
        }
        if let Some(retry) = self.retry {
            out = out.retry(Duration::from_millis(retry));
        }
        // axum splits embedded newlines into multiple `data:` lines.
        out.data(self.data)
    }
}

/// Render one reassembled chunk: `event:` from the stream metadata's
/// event name (error chunks default to `error`), `id:` from the last
/// event id, `retry:` when present, and the payload's `data`.
fn render_chunk(chunk: StreamChunk) -> RenderedEvent {
    let event = match (&chunk.metadata.event_name, chunk.metadata.chunk_type) {
        (Some(name), _) => Some(name.clone()),
        (None, ChunkType::Error) => Some("error".to_string()),
        _ => None,
    };
    RenderedEvent {
        event,
        id: chunk.metadata.last_event_id.clone(),
        retry: chunk.metadata.retry,
        data: chunk.payload.data.unwrap_or_default(),
    }
}

/// Render a terminal stream failure as an `error` event carrying a
/// JSON-RPC error object.
fn render_error(code: i64, message: &str) -> RenderedEvent {
    let body = jsonrpc::error_body(&serde_json::Value::Null, code, message);
    RenderedEvent {
        event: Some("error".to_string()),
        id: None,
        retry: None,
        data: body.to_string(),
    }
}

/// Turn a registered stream waiter into the SSE HTTP response. The
/// response body closes when the final chunk arrives, the stream fails,
/// or the waiter is torn down; dropping the body (client disconnect)
/// drops the waiter, which cancels the registry entry.
pub fn sse_response(waiter: StreamWaiter, correlation_id: &CorrelationId) -> Response {
    let events = async_stream::stream! {
        let mut waiter = waiter;
        while let Some(event) = waiter.next_event().await {
            match event {
                StreamEvent::Chunk(chunk) => {
                    yield Ok::<Event, Infallible>(render_chunk(chunk).into_event());
                }
                StreamEvent::Error { code, message } => {
                    yield Ok(render_error(code, &message).into_event());
                    break;
                }
                StreamEvent::End => break,
            }
        }
    };

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_bus::{ChunkPayload, StreamMetadata};

    fn chunk(
        data: &str,
        event_name: Option<&str>,
        chunk_type: ChunkType,
        last_event_id: Option<&str>,
        retry: Option<u64>,
    ) -> StreamChunk {
        StreamChunk {
            sequence: 0,
            payload: ChunkPayload {
                data: Some(data.to_string()),
                ..Default::default()
            },
            metadata: StreamMetadata {
                stream_id: "s".to_string(),
                chunk_type,
                event_name: event_name.map(str::to_string),
                retry,
                last_event_id: last_event_id.map(str::to_string),
                is_final: false,
            },
        }
    }

    #[test]
    fn test_data_chunk_renders_bare_data() {
        let rendered = render_chunk(chunk("A", None, ChunkType::Data, None, None));
        assert_eq!(
            rendered,
            RenderedEvent {
                event: None,
                id: None,
                retry: None,
                data: "A".to_string(),
            }
        );
    }

    #[test]
    fn test_named_event_fields_preserved() {
        let rendered = render_chunk(chunk(
            "A",
            Some("task-update"),
            ChunkType::Event,
            Some("42"),
            Some(1500),
        ));
        assert_eq!(rendered.event.as_deref(), Some("task-update"));
        assert_eq!(rendered.id.as_deref(), Some("42"));
        assert_eq!(rendered.retry, Some(1500));
        assert_eq!(rendered.data, "A");
    }

    #[test]
    fn test_error_chunk_defaults_to_error_event() {
        let rendered = render_chunk(chunk("boom", None, ChunkType::Error, None, None));
        assert_eq!(rendered.event.as_deref(), Some("error"));
        assert_eq!(rendered.data, "boom");
    }

    #[test]
    fn test_render_error_carries_jsonrpc_body() {
        let rendered = render_error(-32603, "Stream out-of-order window exceeded");
        assert_eq!(rendered.event.as_deref(), Some("error"));
        let body: serde_json::Value = serde_json::from_str(&rendered.data).unwrap();
        assert_eq!(body["error"]["code"], -32603);
        assert_eq!(
            body["error"]["message"],
            "Stream out-of-order window exceeded"
        );
    }
}
