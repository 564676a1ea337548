//! Background bus receivers.
//!
//! One request receiver runs per locally-hosted agent: it drains the
//! group's requests topic (filtered on `toAgent`), forwards to the agent
//! over local HTTP and publishes the reply — or the chunked SSE stream —
//! on the responses topic. The reply is always published before the
//! request delivery is acked, so a crash between the two redelivers the
//! request and the requester's dedup collapses the duplicates.
//!
//! One response subscriber runs per group: it feeds reply and chunk
//! envelopes back into the pending registry. Chunk deliveries are
//! settled by a per-delivery task, so a slow stream only stalls its own
//! bus session, never the shared subscription.

use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_bus::{
    subscription_name, ChunkPayload, ChunkType, Delivery, Envelope, EnvelopeBody, Headers,
    Selector, StreamMetadata, SubscriptionRole, Topic, STATUS_HEADER,
};
use courier_common::{now_ms, GroupId, ProxyId, RetryPolicy};

use crate::directory::AgentEntry;
use crate::jsonrpc::{self, codes};
use crate::routing::forward::ForwardError;
use crate::routing::AppState;
use crate::sse::upstream;

use std::time::Duration;

/// Receiver loops restart forever with bounded backoff.
const RESTART_BACKOFF: RetryPolicy = RetryPolicy {
    max_attempts: u32::MAX,
    base_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(10),
};

/// Spawn one request receiver per locally-hosted agent.
pub fn spawn_request_receivers(state: &AppState) -> Vec<JoinHandle<()>> {
    state
        .directory
        .hosted_entries()
        .into_iter()
        .map(|entry| {
            let state = state.clone();
            let entry = entry.clone();
            tokio::spawn(async move { run_request_receiver(state, entry).await })
        })
        .collect()
}

/// Spawn one response subscriber per group in the registry.
pub fn spawn_response_subscribers(state: &AppState) -> Vec<JoinHandle<()>> {
    state
        .directory
        .all_groups()
        .into_iter()
        .map(|group| {
            let state = state.clone();
            tokio::spawn(async move { run_response_subscriber(state, group).await })
        })
        .collect()
}

async fn run_request_receiver(state: AppState, entry: AgentEntry) {
    let topic = Topic::requests(&entry.group);
    // Name derived from (proxy, selector): the agent id disambiguates
    // multiple hosted agents in one group.
    let subscription = format!(
        "{}.{}",
        subscription_name(&state.options.proxy_id, &entry.group, SubscriptionRole::Requests),
        entry.id
    );

    let mut attempt = 0u32;
    loop {
        match state
            .bus
            .subscribe(&topic, Selector::ToAgent(entry.id.clone()), &subscription)
            .await
        {
            Ok(mut deliveries) => {
                info!(agent = %entry.id, topic = %topic, "request receiver attached");
                attempt = 0;
                while let Some(delivery) = deliveries.next().await {
                    handle_request(&state, &entry, delivery).await;
                }
                warn!(agent = %entry.id, topic = %topic, "request subscription ended");
            }
            Err(e) => {
                warn!(agent = %entry.id, topic = %topic, error = %e, "request subscribe failed");
            }
        }
        RESTART_BACKOFF.wait(attempt).await;
        attempt = attempt.saturating_add(1);
    }
}

async fn run_response_subscriber(state: AppState, group: GroupId) {
    let topic = Topic::responses(&group);
    let subscription =
        subscription_name(&state.options.proxy_id, &group, SubscriptionRole::Responses);

    let mut attempt = 0u32;
    loop {
        match state
            .bus
            .subscribe(
                &topic,
                Selector::ToProxy(state.options.proxy_id.clone()),
                &subscription,
            )
            .await
        {
            Ok(mut deliveries) => {
                info!(group = %group, topic = %topic, "response subscriber attached");
                attempt = 0;
                while let Some(delivery) = deliveries.next().await {
                    route_response(&state, delivery).await;
                }
                warn!(group = %group, topic = %topic, "response subscription ended");
            }
            Err(e) => {
                warn!(group = %group, topic = %topic, error = %e, "response subscribe failed");
            }
        }
        RESTART_BACKOFF.wait(attempt).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Fan one response delivery into the registry. Replies settle inline;
/// chunks settle from their own task once the registry accepted them.
async fn route_response(state: &AppState, delivery: Delivery) {
    if delivery.envelope.is_expired(now_ms()) {
        debug!(
            correlation_id = %delivery.envelope.correlation_id,
            "expired response envelope dropped"
        );
        let _ = delivery.ack().await;
        return;
    }
    match &delivery.envelope.body {
        EnvelopeBody::Reply { .. } => {
            state.registry.complete(delivery.envelope.clone()).await;
            let _ = delivery.ack().await;
        }
        EnvelopeBody::StreamChunk { .. } => {
            let registry = state.registry.clone();
            tokio::spawn(async move {
                // The bounded stream channel applies back-pressure here;
                // the delivery stays unsettled until the chunk is in.
                registry.complete(delivery.envelope.clone()).await;
                let _ = delivery.ack().await;
            });
        }
        EnvelopeBody::Request { .. } => {
            warn!(
                correlation_id = %delivery.envelope.correlation_id,
                "request envelope on responses topic"
            );
            let _ = delivery.dead_letter("request on responses topic").await;
        }
    }
}

async fn handle_request(state: &AppState, entry: &AgentEntry, delivery: Delivery) {
    if delivery.envelope.is_expired(now_ms()) {
        debug!(
            correlation_id = %delivery.envelope.correlation_id,
            "expired request envelope dropped"
        );
        let _ = delivery.ack().await;
        return;
    }

    let request = delivery.envelope.clone();
    let EnvelopeBody::Request {
        http_path,
        method,
        is_stream,
        reply_to,
        payload,
    } = request.body.clone()
    else {
        warn!(correlation_id = %request.correlation_id, "non-request envelope on requests topic");
        let _ = delivery.dead_letter("unexpected envelope kind").await;
        return;
    };

    let Some(endpoint) = entry.endpoint.clone() else {
        error!(agent = %entry.id, "hosted agent has no endpoint");
        let _ = delivery.dead_letter("hosted agent without endpoint").await;
        return;
    };

    debug!(
        correlation_id = %request.correlation_id,
        agent = %entry.id,
        path = %http_path,
        is_stream,
        "request received from bus"
    );

    if is_stream {
        handle_stream_request(
            state, &request, &endpoint, &method, &http_path, reply_to, payload, delivery,
        )
        .await;
    } else {
        handle_unary_request(
            state, &request, &endpoint, &method, &http_path, reply_to, payload, delivery,
        )
        .await;
    }
}

// ---------------------------------------------------------------------------
// Non-stream requests
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn handle_unary_request(
    state: &AppState,
    request: &Envelope,
    endpoint: &str,
    method: &str,
    path: &str,
    reply_to: ProxyId,
    payload: Value,
    delivery: Delivery,
) {
    let rpc_id = jsonrpc::extract_id(&payload);
    let (status, reply_payload) = match state
        .forwarder
        .forward(endpoint, method, path, &request.headers, &payload, false)
        .await
    {
        Ok(response) => {
            let status = response.status().as_u16();
            match response.bytes().await {
                Ok(bytes) if bytes.is_empty() => (status, Value::Null),
                Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => (status, value),
                    Err(e) => {
                        warn!(
                            correlation_id = %request.correlation_id,
                            error = %e,
                            "agent returned non-JSON body"
                        );
                        (
                            502,
                            jsonrpc::error_body(&rpc_id, codes::INTERNAL_ERROR, "Agent unavailable"),
                        )
                    }
                },
                Err(e) => {
                    warn!(
                        correlation_id = %request.correlation_id,
                        error = %e,
                        "agent response body read failed"
                    );
                    (
                        502,
                        jsonrpc::error_body(&rpc_id, codes::INTERNAL_ERROR, "Agent unavailable"),
                    )
                }
            }
        }
        Err(ForwardError::Timeout) => (
            504,
            jsonrpc::error_body(&rpc_id, codes::INTERNAL_ERROR, "Agent timeout"),
        ),
        Err(_) => (
            502,
            jsonrpc::error_body(&rpc_id, codes::INTERNAL_ERROR, "Agent unavailable"),
        ),
    };

    let mut headers = Headers::new();
    headers.insert("Content-Type", "application/json");
    headers.insert(STATUS_HEADER, status.to_string());
    let reply = Envelope::reply(request, reply_to, headers, reply_payload);
    publish_then_settle(state, &Topic::responses(&request.group), &reply, delivery).await;
}

/// Publish the reply, then settle the request delivery: ack on success,
/// abandon on retriable failure, dead-letter otherwise.
async fn publish_then_settle(state: &AppState, topic: &Topic, reply: &Envelope, delivery: Delivery) {
    match state.bus.publish(topic, reply).await {
        Ok(()) => {
            let _ = delivery.ack().await;
        }
        Err(e) if e.is_retriable() => {
            warn!(
                correlation_id = %reply.correlation_id,
                error = %e,
                "reply publish failed, abandoning request for redelivery"
            );
            let _ = delivery.abandon().await;
        }
        Err(e) => {
            error!(
                correlation_id = %reply.correlation_id,
                error = %e,
                "reply publish failed fatally, dead-lettering request"
            );
            let _ = delivery
                .dead_letter(format!("reply publish failed: {e}"))
                .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Stream requests
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn handle_stream_request(
    state: &AppState,
    request: &Envelope,
    endpoint: &str,
    method: &str,
    path: &str,
    reply_to: ProxyId,
    payload: Value,
    delivery: Delivery,
) {
    let stream_id = Uuid::new_v4().to_string();
    let topic = Topic::responses(&request.group);
    let rpc_id = jsonrpc::extract_id(&payload);

    let response = match state
        .forwarder
        .forward(endpoint, method, path, &request.headers, &payload, true)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            let message = match e {
                ForwardError::Timeout => "Agent timeout",
                _ => "Agent unavailable",
            };
            fail_stream(
                state, &topic, request, &reply_to, &stream_id, 0, &rpc_id, message, delivery,
            )
            .await;
            return;
        }
    };

    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !content_type.starts_with("text/event-stream") {
        // The agent answered a stream request with a plain body: relay
        // it as a single data chunk so the caller still gets a stream.
        let body = response.bytes().await.unwrap_or_default();
        let chunk = Envelope::stream_chunk(
            request,
            reply_to.clone(),
            0,
            ChunkPayload {
                data: Some(String::from_utf8_lossy(&body).into_owned()),
                ..Default::default()
            },
            StreamMetadata {
                stream_id: stream_id.clone(),
                chunk_type: ChunkType::Data,
                event_name: None,
                retry: None,
                last_event_id: None,
                is_final: false,
            },
        );
        if state.bus.publish(&topic, &chunk).await.is_err() {
            let _ = delivery.abandon().await;
            return;
        }
        finish_stream(state, &topic, request, &reply_to, &stream_id, 1, delivery).await;
        return;
    }

    let mut frames = upstream::frames(response);
    let mut sequence: u64 = 0;
    loop {
        match tokio::time::timeout(state.options.stream_idle_timeout, frames.next()).await {
            Ok(Some(Ok(frame))) => {
                let (chunk_payload, metadata) = upstream::chunk_for_frame(&frame, &stream_id);
                let chunk =
                    Envelope::stream_chunk(request, reply_to.clone(), sequence, chunk_payload, metadata);
                if let Err(e) = state.bus.publish(&topic, &chunk).await {
                    // Redelivery restarts the stream from sequence 0;
                    // the requester's dedup collapses what was sent.
                    warn!(
                        correlation_id = %request.correlation_id,
                        sequence,
                        error = %e,
                        "chunk publish failed, abandoning request"
                    );
                    let _ = delivery.abandon().await;
                    return;
                }
                sequence += 1;
            }
            Ok(Some(Err(e))) => {
                warn!(
                    correlation_id = %request.correlation_id,
                    error = %e,
                    "upstream stream error"
                );
                fail_stream(
                    state,
                    &topic,
                    request,
                    &reply_to,
                    &stream_id,
                    sequence,
                    &rpc_id,
                    "Agent unavailable",
                    delivery,
                )
                .await;
                return;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    correlation_id = %request.correlation_id,
                    "upstream stream idle timeout"
                );
                fail_stream(
                    state,
                    &topic,
                    request,
                    &reply_to,
                    &stream_id,
                    sequence,
                    &rpc_id,
                    "Agent timeout",
                    delivery,
                )
                .await;
                return;
            }
        }
    }

    finish_stream(state, &topic, request, &reply_to, &stream_id, sequence, delivery).await;
}

/// Publish the terminal end chunk; ack the request only once the bus
/// accepted it.
async fn finish_stream(
    state: &AppState,
    topic: &Topic,
    request: &Envelope,
    reply_to: &ProxyId,
    stream_id: &str,
    sequence: u64,
    delivery: Delivery,
) {
    let end = Envelope::stream_chunk(
        request,
        reply_to.clone(),
        sequence,
        ChunkPayload::default(),
        upstream::end_metadata(stream_id),
    );
    publish_then_settle(state, topic, &end, delivery).await;
}

/// Publish an error chunk followed by the end chunk, then settle.
#[allow(clippy::too_many_arguments)]
async fn fail_stream(
    state: &AppState,
    topic: &Topic,
    request: &Envelope,
    reply_to: &ProxyId,
    stream_id: &str,
    sequence: u64,
    rpc_id: &Value,
    message: &str,
    delivery: Delivery,
) {
    let error_chunk = Envelope::stream_chunk(
        request,
        reply_to.clone(),
        sequence,
        ChunkPayload {
            data: Some(jsonrpc::error_body(rpc_id, codes::INTERNAL_ERROR, message).to_string()),
            event: Some("error".to_string()),
            ..Default::default()
        },
        StreamMetadata {
            stream_id: stream_id.to_string(),
            chunk_type: ChunkType::Error,
            event_name: Some("error".to_string()),
            retry: None,
            last_event_id: None,
            is_final: false,
        },
    );
    if let Err(e) = state.bus.publish(topic, &error_chunk).await {
        warn!(
            correlation_id = %request.correlation_id,
            error = %e,
            "error chunk publish failed, abandoning request"
        );
        let _ = delivery.abandon().await;
        return;
    }
    finish_stream(state, topic, request, reply_to, stream_id, sequence + 1, delivery).await;
}

