//! Envelope wire format.
//!
//! The envelope is the sole payload format on the bus: a tagged union of
//! `request`, `reply` and `stream_chunk` bodies under a shared routing
//! header. The wire encoding is UTF-8 JSON. Incoherent combinations
//! (e.g. a terminal marker on a data chunk) are rejected at decode time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use courier_common::{AgentId, CorrelationId, GroupId, ProxyId};

/// Protocol version tag carried on every envelope.
pub const PROTOCOL_VERSION: &str = "a2a-jsonrpc-sse/1.0";

/// Reserved envelope header carrying the local agent's HTTP status on a
/// reply, so the originating proxy can return non-200 statuses faithfully.
pub const STATUS_HEADER: &str = "x-courier-status";

/// Default per-message TTL (1 hour), matching the topic-level default.
pub const DEFAULT_TTL_MS: u64 = 60 * 60 * 1000;

/// Hop-by-hop headers; stripped before wrapping, never re-emitted.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Envelope validation errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Envelope decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Incoherent envelope: {0}")]
    Incoherent(&'static str),
}

/// Flat HTTP header map: case-insensitive names, case-preserved values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect headers, silently dropping hop-by-hop names.
    pub fn from_filtered<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut headers = Self::new();
        for (name, value) in pairs {
            if !Self::is_hop_by_hop(name) {
                headers.insert(name, value);
            }
        }
        headers
    }

    /// True for headers that must not cross the proxy boundary.
    pub fn is_hop_by_hop(name: &str) -> bool {
        HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
    }

    /// Insert a header, replacing any existing value under a
    /// case-insensitive match while preserving the new name's case.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.insert(name, value.into());
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Case-insensitive removal. Returns the removed value, if any.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let key = self
            .0
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()?;
        self.0.remove(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Chunk classification inside a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Ordinary SSE data event.
    Data,
    /// SSE event with an explicit event name.
    Event,
    /// Upstream error surfaced mid-stream.
    Error,
    /// Terminal marker; produces no bytes downstream.
    End,
}

/// SSE fields captured from (or replayed to) one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

/// Per-chunk stream bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Stable id for the whole stream (one per correlation).
    pub stream_id: String,
    pub chunk_type: ChunkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    /// True exactly once per stream, on the last envelope.
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// The three envelope bodies. The `kind` tag is part of the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeBody {
    /// A wrapped ingress HTTP request.
    Request {
        /// Original path suffix (starting at `/v1/…`), forwarded verbatim.
        http_path: String,
        /// Original HTTP method.
        method: String,
        /// True iff the caller expects an SSE reply.
        is_stream: bool,
        /// Originating proxy; responders address the reply to it.
        reply_to: ProxyId,
        /// Opaque JSON-RPC request body.
        payload: Value,
    },
    /// The full JSON-RPC response for a non-stream request.
    Reply {
        /// Requester proxy, surfaced as the `toProxy` routing property.
        to_proxy: ProxyId,
        payload: Value,
    },
    /// One SSE event of a stream reply.
    StreamChunk {
        to_proxy: ProxyId,
        /// Dense ascending run starting at 0, assigned by the publisher.
        sequence: u64,
        payload: ChunkPayload,
        stream_metadata: StreamMetadata,
    },
}

/// The wire container for everything that crosses the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque protocol version tag.
    pub protocol: String,
    /// Agent-group name; selects the topic family.
    pub group: GroupId,
    pub to_agent: AgentId,
    pub from_agent: AgentId,
    pub correlation_id: CorrelationId,
    /// Milliseconds since epoch; informational.
    pub timestamp: u64,
    /// Milliseconds; receivers drop envelopes older than `timestamp + ttl`.
    pub ttl: u64,
    #[serde(default)]
    pub headers: Headers,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

impl Envelope {
    /// Wrap an ingress request.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        group: GroupId,
        to_agent: AgentId,
        from_agent: AgentId,
        correlation_id: CorrelationId,
        reply_to: ProxyId,
        method: impl Into<String>,
        http_path: impl Into<String>,
        is_stream: bool,
        headers: Headers,
        payload: Value,
        ttl: u64,
    ) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            group,
            to_agent,
            from_agent,
            correlation_id,
            timestamp: courier_common::now_ms(),
            ttl,
            headers,
            body: EnvelopeBody::Request {
                http_path: http_path.into(),
                method: method.into(),
                is_stream,
                reply_to,
                payload,
            },
        }
    }

    /// Wrap the reply to `request`, flipping the routing direction.
    /// `to_proxy` is the requester's `reply_to`.
    pub fn reply(request: &Envelope, to_proxy: ProxyId, headers: Headers, payload: Value) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            group: request.group.clone(),
            to_agent: request.from_agent.clone(),
            from_agent: request.to_agent.clone(),
            correlation_id: request.correlation_id.clone(),
            timestamp: courier_common::now_ms(),
            ttl: request.ttl,
            headers,
            body: EnvelopeBody::Reply { to_proxy, payload },
        }
    }

    /// Wrap one stream chunk of the reply to `request`.
    pub fn stream_chunk(
        request: &Envelope,
        to_proxy: ProxyId,
        sequence: u64,
        payload: ChunkPayload,
        stream_metadata: StreamMetadata,
    ) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            group: request.group.clone(),
            to_agent: request.from_agent.clone(),
            from_agent: request.to_agent.clone(),
            correlation_id: request.correlation_id.clone(),
            timestamp: courier_common::now_ms(),
            ttl: request.ttl,
            headers: Headers::new(),
            body: EnvelopeBody::StreamChunk {
                to_proxy,
                sequence,
                payload,
                stream_metadata,
            },
        }
    }

    /// Originating proxy of a request, if this is a request.
    pub fn reply_to(&self) -> Option<&ProxyId> {
        match &self.body {
            EnvelopeBody::Request { reply_to, .. } => Some(reply_to),
            _ => None,
        }
    }

    /// Requester proxy a reply or chunk is addressed to.
    pub fn to_proxy(&self) -> Option<&ProxyId> {
        match &self.body {
            EnvelopeBody::Reply { to_proxy, .. } => Some(to_proxy),
            EnvelopeBody::StreamChunk { to_proxy, .. } => Some(to_proxy),
            EnvelopeBody::Request { .. } => None,
        }
    }

    /// Sequence number; 0 for non-chunk envelopes.
    pub fn sequence(&self) -> u64 {
        match &self.body {
            EnvelopeBody::StreamChunk { sequence, .. } => *sequence,
            _ => 0,
        }
    }

    /// Wire name of the body kind.
    pub fn kind_name(&self) -> &'static str {
        match &self.body {
            EnvelopeBody::Request { .. } => "request",
            EnvelopeBody::Reply { .. } => "reply",
            EnvelopeBody::StreamChunk { .. } => "stream_chunk",
        }
    }

    /// True iff this is a request expecting an SSE reply.
    pub fn is_stream_request(&self) -> bool {
        matches!(&self.body, EnvelopeBody::Request { is_stream: true, .. })
    }

    /// True once `timestamp + ttl` has passed.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.timestamp.saturating_add(self.ttl)
    }

    /// Reject combinations the wire format forbids.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.ttl == 0 {
            return Err(EnvelopeError::Incoherent("ttl must be positive"));
        }
        match &self.body {
            EnvelopeBody::Request { http_path, .. } => {
                if !http_path.starts_with('/') {
                    return Err(EnvelopeError::Incoherent("http_path must be absolute"));
                }
            }
            EnvelopeBody::Reply { .. } => {}
            EnvelopeBody::StreamChunk {
                stream_metadata, ..
            } => {
                let terminal = stream_metadata.chunk_type == ChunkType::End;
                if terminal != stream_metadata.is_final {
                    return Err(EnvelopeError::Incoherent(
                        "final marker is carried by end chunks and only by them",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Encode to the UTF-8 JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate from the wire format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}
