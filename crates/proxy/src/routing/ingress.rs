//! Ingress HTTP surface.
//!
//! Agents (and external clients) talk plain A2A HTTP to these handlers.
//! Requests for locally-hosted agents are forwarded directly; everything
//! else is wrapped in an envelope, published on the group's requests
//! topic and awaited through the pending registry.

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures::TryStreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use courier_bus::{Envelope, Headers, Topic, STATUS_HEADER};
use courier_common::{AgentId, CorrelationId};

use crate::directory::AgentEntry;
use crate::errors::{json_response, ProxyError};
use crate::jsonrpc;
use crate::pending::{SingleOutcome, WaitError};
use crate::routing::forward::ForwardError;
use crate::routing::AppState;
use crate::sse::egress;

/// Assemble the ingress router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/agents/{id}/.well-known/agent.json", get(agent_card))
        .route("/agents/{id}/v1/messages:send", post(messages_send))
        .route("/agents/{id}/v1/messages:stream", post(messages_stream))
        .route("/agents/{id}/v1/tasks:get", get(tasks_get))
        .route("/agents/{id}/v1/tasks:cancel", post(tasks_cancel))
        .route("/agents/{id}/v1/tasks:resubscribe", post(tasks_resubscribe))
        .with_state(state)
}

async fn messages_send(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    unary(state, id, "POST", "/v1/messages:send".to_string(), headers, Some(body)).await
}

async fn tasks_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let path = match query {
        Some(query) => format!("/v1/tasks:get?{query}"),
        None => "/v1/tasks:get".to_string(),
    };
    unary(state, id, "GET", path, headers, None).await
}

async fn tasks_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    unary(state, id, "POST", "/v1/tasks:cancel".to_string(), headers, Some(body)).await
}

async fn messages_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    streaming(state, id, "/v1/messages:stream".to_string(), headers, body).await
}

async fn tasks_resubscribe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    streaming(state, id, "/v1/tasks:resubscribe".to_string(), headers, body).await
}

// ---------------------------------------------------------------------------
// Synchronous flow
// ---------------------------------------------------------------------------

async fn unary(
    state: AppState,
    id: String,
    method: &str,
    path: String,
    headers: HeaderMap,
    body: Option<Bytes>,
) -> Response {
    let agent = AgentId::new(id);
    let payload = match parse_payload(body) {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    let rpc_id = jsonrpc::extract_id(&payload);
    log_request_id(&headers, &agent, &path);

    let Some(entry) = state.directory.get(&agent) else {
        return ProxyError::AgentNotFound { agent }.into_response(&rpc_id, None);
    };
    let envelope_headers = wrap_headers(&headers);

    if state.directory.is_local(&agent) {
        return forward_local(&state, entry, method, &path, &envelope_headers, &payload, &rpc_id)
            .await;
    }

    let correlation = CorrelationId::new();
    let waiter = state
        .registry
        .register_single(correlation.clone(), state.options.request_timeout);
    let envelope = Envelope::request(
        entry.group.clone(),
        agent.clone(),
        from_agent(&headers),
        correlation.clone(),
        state.options.proxy_id.clone(),
        method,
        path,
        false,
        envelope_headers,
        payload,
        state.options.envelope_ttl_ms,
    );

    let topic = Topic::requests(&entry.group);
    if let Err(e) = state.bus.publish(&topic, &envelope).await {
        warn!(correlation_id = %correlation, agent = %agent, error = %e, "request publish failed");
        state.registry.cancel(&correlation, "publish-failed");
        return ProxyError::BusPublish(e).into_response(&rpc_id, Some(&correlation));
    }
    debug!(correlation_id = %correlation, agent = %agent, "request published, awaiting reply");

    match waiter.wait().await {
        SingleOutcome::Reply(reply) => reply_response(reply, &correlation),
        SingleOutcome::Error(WaitError::Timeout) => {
            ProxyError::RequestTimeout.into_response(&rpc_id, Some(&correlation))
        }
        // The client is gone; this response is written to a closed
        // connection, the status is moot.
        SingleOutcome::Error(WaitError::Cancelled) => {
            ProxyError::RequestTimeout.into_response(&rpc_id, Some(&correlation))
        }
    }
}

/// Render a reply envelope: status from the reserved side-channel
/// header (default 200), body from the payload verbatim.
fn reply_response(reply: Envelope, correlation: &CorrelationId) -> Response {
    let status = reply
        .headers
        .get(STATUS_HEADER)
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    let payload = match reply.body {
        courier_bus::EnvelopeBody::Reply { payload, .. } => payload,
        _ => Value::Null,
    };
    json_response(status, &payload, Some(correlation))
}

async fn forward_local(
    state: &AppState,
    entry: &AgentEntry,
    method: &str,
    path: &str,
    headers: &Headers,
    payload: &Value,
    rpc_id: &Value,
) -> Response {
    let Some(endpoint) = entry.endpoint.as_deref() else {
        // Config validation makes this unreachable for hosted agents.
        return ProxyError::UpstreamUnavailable("no endpoint".to_string())
            .into_response(rpc_id, None);
    };
    match state
        .forwarder
        .forward(endpoint, method, path, headers, payload, false)
        .await
    {
        Ok(response) => passthrough(response).await,
        Err(e) => forward_error(e).into_response(rpc_id, None),
    }
}

pub(crate) fn forward_error(e: ForwardError) -> ProxyError {
    match e {
        ForwardError::Timeout => ProxyError::UpstreamTimeout,
        ForwardError::Unavailable(reason) => ProxyError::UpstreamUnavailable(reason),
        ForwardError::Invalid(reason) => ProxyError::InvalidRequest(reason),
    }
}

/// Relay a local agent's response byte-for-byte (status, content type,
/// body). Used for the local fast path, which never touches the bus.
async fn passthrough(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
    match upstream.bytes().await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            if let Some(content_type) = content_type {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            response
        }
        Err(e) => ProxyError::UpstreamUnavailable(e.to_string()).into_response(&Value::Null, None),
    }
}

// ---------------------------------------------------------------------------
// Streaming flow
// ---------------------------------------------------------------------------

async fn streaming(
    state: AppState,
    id: String,
    path: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let agent = AgentId::new(id);
    let payload = match parse_payload(Some(body)) {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    let rpc_id = jsonrpc::extract_id(&payload);
    log_request_id(&headers, &agent, &path);

    let Some(entry) = state.directory.get(&agent) else {
        return ProxyError::AgentNotFound { agent }.into_response(&rpc_id, None);
    };
    let envelope_headers = wrap_headers(&headers);

    if state.directory.is_local(&agent) {
        let Some(endpoint) = entry.endpoint.as_deref() else {
            return ProxyError::UpstreamUnavailable("no endpoint".to_string())
                .into_response(&rpc_id, None);
        };
        return match state
            .forwarder
            .forward(endpoint, "POST", &path, &envelope_headers, &payload, true)
            .await
        {
            Ok(response) => passthrough_stream(response),
            Err(e) => forward_error(e).into_response(&rpc_id, None),
        };
    }

    let correlation = CorrelationId::new();
    let waiter = state
        .registry
        .register_stream(correlation.clone(), state.options.stream_idle_timeout);
    let envelope = Envelope::request(
        entry.group.clone(),
        agent.clone(),
        from_agent(&headers),
        correlation.clone(),
        state.options.proxy_id.clone(),
        "POST",
        path,
        true,
        envelope_headers,
        payload,
        state.options.envelope_ttl_ms,
    );

    let topic = Topic::requests(&entry.group);
    if let Err(e) = state.bus.publish(&topic, &envelope).await {
        warn!(correlation_id = %correlation, agent = %agent, error = %e, "stream request publish failed");
        // The waiter cancels itself when dropped.
        return ProxyError::BusPublish(e).into_response(&rpc_id, Some(&correlation));
    }
    debug!(correlation_id = %correlation, agent = %agent, "stream request published");
    egress::sse_response(waiter, &correlation)
}

/// Relay a local agent's streaming response without buffering.
fn passthrough_stream(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
    let body = Body::from_stream(
        upstream
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );
    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

// ---------------------------------------------------------------------------
// Agent card
// ---------------------------------------------------------------------------

async fn agent_card(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let agent = AgentId::new(id);
    let Some(entry) = state.directory.get(&agent) else {
        return ProxyError::AgentNotFound { agent }.into_response(&Value::Null, None);
    };
    let proxied_url = format!("{}/agents/{}", state.options.base_url, agent);

    let card = match entry.card_source() {
        Some(source) => match state.forwarder.fetch_card(&source).await {
            Ok(mut card) => {
                if let Some(object) = card.as_object_mut() {
                    object.insert("url".to_string(), json!(proxied_url));
                }
                card
            }
            Err(e) => {
                warn!(agent = %agent, error = %e, "agent card fetch failed, serving minimal card");
                minimal_card(&agent, &proxied_url, &e.to_string())
            }
        },
        None => minimal_card(&agent, &proxied_url, "no card endpoint configured"),
    };
    json_response(StatusCode::OK, &card, None)
}

fn minimal_card(agent: &AgentId, url: &str, reason: &str) -> Value {
    json!({
        "name": agent.as_str(),
        "url": url,
        "version": "unknown",
        "error": reason,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse the JSON-RPC body; an empty body becomes `null` (GET flows).
fn parse_payload(body: Option<Bytes>) -> Result<Value, Response> {
    match body {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).map_err(|e| {
            ProxyError::InvalidRequest(e.to_string()).into_response(&Value::Null, None)
        }),
        _ => Ok(Value::Null),
    }
}

/// Envelope headers from the ingress request: hop-by-hop names are
/// stripped by construction, connection-scoped names explicitly.
fn wrap_headers(headers: &HeaderMap) -> Headers {
    let pairs: Vec<(&str, &str)> = headers
        .iter()
        .filter(|(name, _)| {
            !name.as_str().eq_ignore_ascii_case("host")
                && !name.as_str().eq_ignore_ascii_case("content-length")
        })
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect();
    Headers::from_filtered(pairs)
}

/// `From-Agent` (or `X-From-Agent`) names the caller; default "proxy".
fn from_agent(headers: &HeaderMap) -> AgentId {
    headers
        .get("from-agent")
        .or_else(|| headers.get("x-from-agent"))
        .and_then(|v| v.to_str().ok())
        .map(AgentId::new)
        .unwrap_or_else(|| AgentId::new("proxy"))
}

fn log_request_id(headers: &HeaderMap, agent: &AgentId, path: &str) {
    if let Some(request_id) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        debug!(agent = %agent, path, request_id, "ingress request");
    } else {
        debug!(agent = %agent, path, "ingress request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_wrap_headers_strips_connection_scope() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("host", HeaderValue::from_static("proxy.example.com"));
        headers.insert("x-request-id", HeaderValue::from_static("r-1"));

        let wrapped = wrap_headers(&headers);
        assert_eq!(wrapped.get("content-type"), Some("application/json"));
        assert_eq!(wrapped.get("x-request-id"), Some("r-1"));
        assert!(wrapped.get("connection").is_none());
        assert!(wrapped.get("host").is_none());
    }

    #[test]
    fn test_from_agent_header_fallbacks() {
        let mut headers = HeaderMap::new();
        assert_eq!(from_agent(&headers), AgentId::new("proxy"));

        headers.insert("x-from-agent", HeaderValue::from_static("writer"));
        assert_eq!(from_agent(&headers), AgentId::new("writer"));

        headers.insert("from-agent", HeaderValue::from_static("critic"));
        assert_eq!(from_agent(&headers), AgentId::new("critic"));
    }

    #[test]
    fn test_parse_payload_empty_is_null() {
        assert_eq!(parse_payload(None).unwrap(), Value::Null);
        assert_eq!(parse_payload(Some(Bytes::new())).unwrap(), Value::Null);
        assert!(parse_payload(Some(Bytes::from_static(b"{ nope"))).is_err());
    }

    #[test]
    fn test_minimal_card_shape() {
        let card = minimal_card(&AgentId::new("critic"), "http://p1/agents/critic", "down");
        assert_eq!(card["name"], "critic");
        assert_eq!(card["url"], "http://p1/agents/critic");
        assert_eq!(card["version"], "unknown");
        assert_eq!(card["error"], "down");
    }
}
