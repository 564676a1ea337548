//! End-to-end scenarios: two proxies over one in-process bus, with stub
//! agents on ephemeral ports.
//!
//! P1 hosts `writer`; P2 hosts `critic`; `oracle` is registered as
//! hosted by a third proxy the tests impersonate directly on the bus.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::timeout;

use courier_bus::{
    BusAdapter, Delivery, DeliveryStream, Envelope, MemoryBus, MemoryBusConfig, Selector, Topic,
};
use courier_common::GroupId;
use courier_config::CourierConfig;
use courier_proxy::App;

const GROUP: &str = "blog-agents";

fn group() -> GroupId {
    GroupId::new(GROUP)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Stub writer agent: fixed reply, plus an agent card.
fn writer_agent() -> Router {
    Router::new()
        .route(
            "/v1/messages:send",
            post(|| async {
                Json(json!({"jsonrpc": "2.0", "result": {"id": "task-1"}, "id": "r1"}))
            }),
        )
        .route(
            "/.well-known/agent.json",
            get(|| async {
                Json(json!({"name": "writer", "url": "http://127.0.0.1:9101", "version": "1.2.0"}))
            }),
        )
}

/// Stub critic agent: echoes the request id; streams A, B, C.
fn critic_agent(reply_delay: Duration) -> Router {
    Router::new()
        .route(
            "/v1/messages:send",
            post(move |Json(body): Json<Value>| async move {
                tokio::time::sleep(reply_delay).await;
                Json(json!({
                    "jsonrpc": "2.0",
                    "result": {"review": "approved"},
                    "id": body["id"],
                }))
            }),
        )
        .route(
            "/v1/messages:stream",
            post(|| async {
                let events = futures::stream::iter(["A", "B", "C"])
                    .map(|data| Ok::<Event, Infallible>(Event::default().data(data)));
                Sse::new(events)
            }),
        )
}

fn p1_config(writer_endpoint: SocketAddr, request_secs: u64) -> CourierConfig {
    CourierConfig::from_toml(&format!(
        r#"
        [proxy]
        id = "p1"
        role = "coordinator"
        base_url = "http://p1.test"

        [timeouts]
        request_secs = {request_secs}

        [[agents]]
        id = "writer"
        group = "{GROUP}"
        proxy = "p1"
        endpoint = "{writer_endpoint}"

        [[agents]]
        id = "critic"
        group = "{GROUP}"
        proxy = "p2"

        [[agents]]
        id = "oracle"
        group = "{GROUP}"
        proxy = "p3"
    "#
    ))
    .unwrap()
}

fn p2_config(critic_endpoint: SocketAddr) -> CourierConfig {
    CourierConfig::from_toml(&format!(
        r#"
        [proxy]
        id = "p2"
        base_url = "http://p2.test"

        [[agents]]
        id = "writer"
        group = "{GROUP}"
        proxy = "p1"

        [[agents]]
        id = "critic"
        group = "{GROUP}"
        proxy = "p2"
        endpoint = "{critic_endpoint}"
    "#
    ))
    .unwrap()
}

struct Fixture {
    bus: MemoryBus,
    p1: App,
    #[allow(dead_code)]
    p2: App,
    p1_addr: SocketAddr,
    client: reqwest::Client,
}

/// Build both proxies over one shared bus and wait for the background
/// subscriptions to attach.
async fn fixture_with(request_secs: u64, critic_delay: Duration) -> Fixture {
    let bus = MemoryBus::new(MemoryBusConfig::default());
    bus.ensure_topology(&[group()]).await.unwrap();

    let writer_addr = serve(writer_agent()).await;
    let critic_addr = serve(critic_agent(critic_delay)).await;

    let p1 = App::build(
        &p1_config(writer_addr, request_secs),
        Arc::new(bus.clone()),
    )
    .unwrap();
    let p2 = App::build(&p2_config(critic_addr), Arc::new(bus.clone())).unwrap();

    let p1_addr = serve(p1.router()).await;
    let _ = serve(p2.router()).await;

    // Let the request receivers and response subscribers attach.
    tokio::time::sleep(Duration::from_millis(300)).await;

    Fixture {
        bus,
        p1,
        p2,
        p1_addr,
        client: reqwest::Client::new(),
    }
}

async fn fixture() -> Fixture {
    fixture_with(30, Duration::ZERO).await
}

impl Fixture {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.p1_addr)
    }

    /// Attach a probe subscription (its own copy of every message).
    async fn probe(&self, topic: Topic, name: &str) -> DeliveryStream {
        self.bus.subscribe(&topic, Selector::All, name).await.unwrap()
    }
}

async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("delivery within deadline")
        .expect("stream open")
}

async fn assert_silent(stream: &mut DeliveryStream) {
    assert!(
        timeout(Duration::from_millis(300), stream.next()).await.is_err(),
        "expected no bus traffic"
    );
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Scenario 1: a request to a locally-hosted agent is forwarded over
/// HTTP and never touches the bus.
#[tokio::test]
async fn local_sync_request_bypasses_bus() {
    let fx = fixture().await;
    let mut probe = fx.probe(Topic::requests(&group()), "probe.req").await;

    let response = fx
        .client
        .post(fx.url("/agents/writer/v1/messages:send"))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r1"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"jsonrpc": "2.0", "result": {"id": "task-1"}, "id": "r1"})
    );

    assert_silent(&mut probe).await;
}

/// Scenario 2: a request for an agent hosted on the other proxy crosses
/// the bus as exactly one request and one correlated reply envelope.
#[tokio::test]
async fn cross_proxy_sync_request() {
    let fx = fixture().await;
    let mut req_probe = fx.probe(Topic::requests(&group()), "probe.req").await;
    let mut resp_probe = fx.probe(Topic::responses(&group()), "probe.resp").await;

    let response = fx
        .client
        .post(fx.url("/agents/critic/v1/messages:send"))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r2"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-correlation-id").is_some());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], "r2");
    assert_eq!(body["result"]["review"], "approved");

    let request = next_delivery(&mut req_probe).await;
    assert_eq!(request.properties.to_agent.as_str(), "critic");
    assert_eq!(request.properties.message_type, "request");
    let correlation = request.envelope.correlation_id.clone();
    request.ack().await.unwrap();
    assert_silent(&mut req_probe).await;

    let reply = next_delivery(&mut resp_probe).await;
    assert_eq!(reply.envelope.correlation_id, correlation);
    assert_eq!(reply.properties.message_type, "reply");
    assert_eq!(
        reply.properties.to_proxy.as_ref().map(|p| p.as_str()),
        Some("p1")
    );
    reply.ack().await.unwrap();
    assert_silent(&mut resp_probe).await;
}

/// Scenario 3: a cross-proxy stream arrives as chunk envelopes with
/// dense sequences plus one final end chunk, and the client sees the
/// SSE events in order.
#[tokio::test]
async fn cross_proxy_stream() {
    let fx = fixture().await;
    let mut resp_probe = fx.probe(Topic::responses(&group()), "probe.resp").await;

    let response = fx
        .client
        .post(fx.url("/agents/critic/v1/messages:stream"))
        .json(&json!({"jsonrpc": "2.0", "method": "message/stream", "params": {}, "id": "r4"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    let a = body.find("data: A").expect("A present");
    let b = body.find("data: B").expect("B present");
    let c = body.find("data: C").expect("C present");
    assert!(a < b && b < c, "events must arrive in order");

    // Four envelopes on the bus: sequences 0..2 then the final marker.
    let mut sequences = Vec::new();
    let mut final_seen = false;
    for _ in 0..4 {
        let delivery = next_delivery(&mut resp_probe).await;
        assert_eq!(delivery.properties.message_type, "stream_chunk");
        sequences.push(delivery.envelope.sequence());
        if let courier_bus::EnvelopeBody::StreamChunk {
            stream_metadata, ..
        } = &delivery.envelope.body
        {
            if stream_metadata.is_final {
                assert_eq!(stream_metadata.chunk_type, courier_bus::ChunkType::End);
                final_seen = true;
            }
        }
        delivery.ack().await.unwrap();
    }
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert!(final_seen, "exactly one final chunk closes the stream");
}

/// Scenario 4: no reply within the deadline yields the literal 504
/// timeout body, and the late reply is dropped with a counter bump.
#[tokio::test]
async fn request_timeout_then_late_reply_dropped() {
    let fx = fixture_with(1, Duration::from_secs(3)).await;

    let started = std::time::Instant::now();
    let response = fx
        .client
        .post(fx.url("/agents/critic/v1/messages:send"))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r3"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 504);
    assert!(started.elapsed() < Duration::from_millis(2500));
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32603, "message": "Request timeout"},
            "id": "r3",
        })
    );
    assert_eq!(fx.p1.state().registry.open_waiters(), 0);

    // The critic replies after ~3s; the registry must drop it.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(fx.p1.state().registry.stats().late_drops >= 1);
}

/// Scenario 5: unknown agents get the literal 404 body and produce no
/// bus traffic.
#[tokio::test]
async fn unknown_agent_rejected() {
    let fx = fixture().await;
    let mut probe = fx.probe(Topic::requests(&group()), "probe.req").await;

    let response = fx
        .client
        .post(fx.url("/agents/ghost/v1/messages:send"))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r9"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32001, "message": "Agent not found"},
            "id": "r9",
        })
    );
    assert_silent(&mut probe).await;
}

/// Scenario 6: a redelivered chunk sequence is dropped; the client sees
/// each sequence exactly once. The test impersonates oracle's hosting
/// proxy directly on the bus.
#[tokio::test]
async fn duplicate_chunk_suppressed() {
    let fx = fixture().await;

    // Catch the request the way p3's receiver would.
    let mut oracle_requests = fx
        .bus
        .subscribe(
            &Topic::requests(&group()),
            Selector::ToAgent("oracle".into()),
            "p3.blog-agents.req.oracle",
        )
        .await
        .unwrap();

    let client = fx.client.clone();
    let url = fx.url("/agents/oracle/v1/messages:stream");
    let call = tokio::spawn(async move {
        let response = client
            .post(url)
            .json(&json!({"jsonrpc": "2.0", "method": "message/stream", "params": {}, "id": "r6"}))
            .send()
            .await
            .unwrap();
        response.text().await.unwrap()
    });

    let request = next_delivery(&mut oracle_requests).await;
    let request_env = request.envelope.clone();
    let reply_to = request_env.reply_to().unwrap().clone();
    request.ack().await.unwrap();

    let topic = Topic::responses(&group());
    let chunk = |sequence: u64, data: &str| {
        Envelope::stream_chunk(
            &request_env,
            reply_to.clone(),
            sequence,
            courier_bus::ChunkPayload {
                data: Some(data.to_string()),
                ..Default::default()
            },
            courier_bus::StreamMetadata {
                stream_id: "s6".to_string(),
                chunk_type: courier_bus::ChunkType::Data,
                event_name: None,
                retry: None,
                last_event_id: None,
                is_final: false,
            },
        )
    };
    let end = Envelope::stream_chunk(
        &request_env,
        reply_to.clone(),
        3,
        courier_bus::ChunkPayload::default(),
        courier_bus::StreamMetadata {
            stream_id: "s6".to_string(),
            chunk_type: courier_bus::ChunkType::End,
            event_name: None,
            retry: None,
            last_event_id: None,
            is_final: true,
        },
    );

    fx.bus.publish(&topic, &chunk(0, "s0")).await.unwrap();
    fx.bus.publish(&topic, &chunk(1, "s1")).await.unwrap();
    // Redelivery of sequence 1.
    fx.bus.publish(&topic, &chunk(1, "s1")).await.unwrap();
    fx.bus.publish(&topic, &chunk(2, "s2")).await.unwrap();
    fx.bus.publish(&topic, &end).await.unwrap();

    let body = timeout(Duration::from_secs(5), call).await.unwrap().unwrap();
    assert_eq!(body.matches("data: s0").count(), 1);
    assert_eq!(body.matches("data: s1").count(), 1);
    assert_eq!(body.matches("data: s2").count(), 1);
    assert!(fx.p1.state().registry.stats().duplicate_chunks >= 1);
}

// ---------------------------------------------------------------------------
// Supplementary coverage
// ---------------------------------------------------------------------------

/// The agent card is fetched from the hosting agent and its `url` field
/// rewritten to the proxy surface.
#[tokio::test]
async fn agent_card_url_rewritten() {
    let fx = fixture().await;

    let response = fx
        .client
        .get(fx.url("/agents/writer/.well-known/agent.json"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let card: Value = response.json().await.unwrap();
    assert_eq!(card["name"], "writer");
    assert_eq!(card["version"], "1.2.0");
    assert_eq!(card["url"], "http://p1.test/agents/writer");
}

/// When the card cannot be fetched a minimal card is served with 200.
#[tokio::test]
async fn agent_card_fallback_when_unreachable() {
    let fx = fixture().await;

    // critic has no endpoint and no card_url on p1.
    let response = fx
        .client
        .get(fx.url("/agents/critic/.well-known/agent.json"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let card: Value = response.json().await.unwrap();
    assert_eq!(card["name"], "critic");
    assert_eq!(card["version"], "unknown");
    assert_eq!(card["url"], "http://p1.test/agents/critic");
    assert!(card["error"].is_string());
}

/// A locally-hosted agent that is down maps to 502 "Agent unavailable".
#[tokio::test]
async fn local_agent_down_maps_to_bad_gateway() {
    // Point writer at a port nothing listens on.
    let bus = MemoryBus::new(MemoryBusConfig::default());
    bus.ensure_topology(&[group()]).await.unwrap();
    let dead: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let p1 = App::build(&p1_config(dead, 30), Arc::new(bus.clone())).unwrap();
    let p1_addr = serve(p1.router()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{p1_addr}/agents/writer/v1/messages:send"))
        .json(&json!({"jsonrpc": "2.0", "method": "message/send", "params": {}, "id": "r7"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32603);
    assert_eq!(body["error"]["message"], "Agent unavailable");
    assert_eq!(body["id"], "r7");
}

/// Malformed JSON bodies are rejected with the invalid-request code.
#[tokio::test]
async fn malformed_body_rejected() {
    let fx = fixture().await;

    let response = fx
        .client
        .post(fx.url("/agents/critic/v1/messages:send"))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32600);
}
