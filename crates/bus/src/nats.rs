//! NATS JetStream bus backend.
//!
//! Maps the adapter contract onto JetStream: one stream per topic, the
//! selector as a filter subject, the session as a subject token (so
//! per-correlation order is the broker's per-subject order), settlement
//! as ack / NAK / TERM, and publish de-duplication via `Nats-Msg-Id`
//! within the stream's duplicate window.
//!
//! Subject layout:
//!
//! ```text
//! a2a.{group}.requests.{to_agent}
//! a2a.{group}.responses.{to_proxy}.{correlation_id}
//! a2a.{group}.deadletter.{message_type}
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConsumerConfig, AckPolicy, DeliverPolicy, ReplayPolicy},
    stream::Config as StreamConfig,
    Context as JetStreamContext,
};

use courier_common::{GroupId, RetryPolicy};

use crate::adapter::{
    BusAdapter, BusError, Delivery, DeliveryStream, MessageProperties, Selector, Settle, Settlement,
};
use crate::envelope::Envelope;
use crate::topology::{Topic, TopicKind, TopicSpec};

/// Messages fetched per pull batch.
const FETCH_BATCH: usize = 32;

/// Pause between empty fetches to avoid hammering the broker.
const EMPTY_FETCH_PAUSE: std::time::Duration = std::time::Duration::from_millis(100);

/// JetStream backend configuration.
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    /// Server URL, e.g. `nats://localhost:4222`.
    pub url: String,
    /// Deliveries per message before the broker stops redelivering.
    pub max_delivery_count: u32,
    /// Capacity of each subscription's consumer channel.
    pub delivery_buffer: usize,
    /// Publish retry policy (backoff + jitter).
    pub publish_retry: RetryPolicy,
    /// Properties applied to streams created by `ensure_topology`.
    pub topic_spec: TopicSpec,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            max_delivery_count: 5,
            delivery_buffer: 16,
            publish_retry: RetryPolicy::default(),
            topic_spec: TopicSpec::default(),
        }
    }
}

/// JetStream-backed bus adapter.
pub struct NatsBus {
    jetstream: JetStreamContext,
    cfg: NatsBusConfig,
}

impl NatsBus {
    /// Connect to the NATS server.
    pub async fn connect(cfg: NatsBusConfig) -> Result<Self, BusError> {
        info!(url = %cfg.url, "connecting to NATS");
        let client = async_nats::connect(&cfg.url)
            .await
            .map_err(|e| BusError::Connection(format!("NATS connect failed: {e}")))?;
        Ok(Self {
            jetstream: jetstream::new(client),
            cfg,
        })
    }

    async fn publish_once(
        &self,
        subject: &str,
        headers: &async_nats::HeaderMap,
        body: &[u8],
    ) -> Result<(), BusError> {
        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers.clone(), body.to_vec().into())
            .await
            .map_err(|e| BusError::PublishFailed(format!("publish failed: {e}")))?;
        ack.await
            .map_err(|e| BusError::PublishFailed(format!("publish not acknowledged: {e}")))?;
        Ok(())
    }
}

/// Stream name for a topic: dots are not valid in stream names.
fn stream_name(topic: &Topic) -> String {
    topic.name().replace('.', "-")
}

/// Subject tokens must not contain NATS wildcards or separators.
fn token(raw: &str) -> String {
    raw.replace(['.', '*', '>'], "-")
}

/// Subject one concrete message is published on.
fn subject_for(topic: &Topic, properties: &MessageProperties) -> String {
    let base = topic.name();
    match topic.kind() {
        TopicKind::Requests => format!("{base}.{}", token(properties.to_agent.as_str())),
        TopicKind::Responses => {
            let proxy = properties
                .to_proxy
                .as_ref()
                .map(|p| token(p.as_str()))
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "{base}.{proxy}.{}",
                token(properties.correlation_id.as_str())
            )
        }
        TopicKind::Deadletter => format!("{base}.{}", properties.message_type),
    }
}

/// Filter subject mirroring a selector.
fn filter_for(topic: &Topic, selector: &Selector) -> String {
    let base = topic.name();
    match selector {
        Selector::All => format!("{base}.>"),
        Selector::ToAgent(agent) => format!("{base}.{}", token(agent.as_str())),
        Selector::ToProxy(proxy) => format!("{base}.{}.>", token(proxy.as_str())),
        Selector::Correlation(correlation) => {
            format!("{base}.*.{}", token(correlation.as_str()))
        }
    }
}

fn properties_headers(properties: &MessageProperties) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    headers.insert("Nats-Msg-Id", properties.message_id.clone());
    headers.insert("CC-Session-Id", properties.session_id.clone());
    headers.insert("CC-Content-Type", properties.content_type.to_string());
    headers.insert("CC-To-Agent", properties.to_agent.to_string());
    headers.insert("CC-From-Agent", properties.from_agent.to_string());
    headers.insert("CC-Group", properties.group.to_string());
    headers.insert("CC-Message-Type", properties.message_type.to_string());
    if let Some(proxy) = &properties.to_proxy {
        headers.insert("CC-To-Proxy", proxy.to_string());
    }
    headers
}

fn classify(err_text: String) -> BusError {
    let lowered = err_text.to_ascii_lowercase();
    if lowered.contains("permission") || lowered.contains("authorization") {
        BusError::PermissionDenied(err_text)
    } else {
        BusError::Connection(err_text)
    }
}

struct NatsSettler {
    message: jetstream::Message,
    jetstream: JetStreamContext,
    topic: Topic,
}

#[async_trait]
impl Settle for NatsSettler {
    async fn settle(self: Box<Self>, outcome: Settlement) -> Result<(), BusError> {
        match outcome {
            Settlement::Ack => self
                .message
                .ack()
                .await
                .map_err(|e| BusError::Connection(format!("ack failed: {e}"))),
            Settlement::Abandon => self
                .message
                .ack_with(jetstream::AckKind::Nak(None))
                .await
                .map_err(|e| BusError::Connection(format!("nak failed: {e}"))),
            Settlement::DeadLetter { reason } => {
                warn!(topic = %self.topic, reason, "dead-lettering message");
                let deadletter = self.topic.deadletter_peer();
                // Re-publish the raw payload on the deadletter subject,
                // then TERM the original so it is never redelivered.
                let subject = format!("{}.{}", deadletter.name(), "poison");
                let ack = self
                    .jetstream
                    .publish(subject, self.message.payload.clone())
                    .await
                    .map_err(|e| BusError::PublishFailed(format!("deadletter publish: {e}")))?;
                ack.await
                    .map_err(|e| BusError::PublishFailed(format!("deadletter ack: {e}")))?;
                self.message
                    .ack_with(jetstream::AckKind::Term)
                    .await
                    .map_err(|e| BusError::Connection(format!("term failed: {e}")))
            }
        }
    }

    fn abandon_on_drop(&mut self) {
        // Nothing to do: an unacked JetStream message is redelivered
        // after its ack wait elapses.
    }
}

#[async_trait]
impl BusAdapter for NatsBus {
    async fn ensure_topology(&self, groups: &[GroupId]) -> Result<(), BusError> {
        for group in groups {
            for topic in [
                Topic::requests(group),
                Topic::responses(group),
                Topic::deadletter(group),
            ] {
                let spec = &self.cfg.topic_spec;
                let config = StreamConfig {
                    name: stream_name(&topic),
                    subjects: vec![format!("{}.>", topic.name())],
                    max_bytes: (spec.max_size_mb * 1024 * 1024) as i64,
                    max_age: spec.message_ttl,
                    duplicate_window: spec.duplicate_window,
                    ..Default::default()
                };

                match self.jetstream.get_stream(&config.name).await {
                    Ok(mut stream) => {
                        let info = stream
                            .info()
                            .await
                            .map_err(|e| classify(format!("stream info failed: {e}")))?;
                        if info.config.max_age != config.max_age
                            || info.config.max_bytes != config.max_bytes
                            || info.config.duplicate_window != config.duplicate_window
                        {
                            warn!(
                                topic = %topic,
                                "topic exists with divergent properties, leaving untouched"
                            );
                        }
                    }
                    Err(_) => {
                        info!(topic = %topic, stream = %config.name, "creating stream");
                        self.jetstream
                            .create_stream(config)
                            .await
                            .map_err(|e| classify(format!("stream create failed: {e}")))?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        selector: Selector,
        subscription: &str,
    ) -> Result<DeliveryStream, BusError> {
        let stream = self
            .jetstream
            .get_stream(stream_name(topic))
            .await
            .map_err(|_| BusError::TopicNotFound(topic.name()))?;

        let durable = token(subscription);
        let consumer_config = PullConsumerConfig {
            durable_name: Some(durable.clone()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            replay_policy: ReplayPolicy::Instant,
            filter_subject: filter_for(topic, &selector),
            max_deliver: self.cfg.max_delivery_count as i64,
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(&durable, consumer_config)
            .await
            .map_err(|e| classify(format!("consumer create failed: {e}")))?;

        debug!(
            topic = %topic,
            subscription = %durable,
            filter = %selector.describe(),
            "subscription attached"
        );

        let (tx, rx) = mpsc::channel(self.cfg.delivery_buffer);
        let jetstream = self.jetstream.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            loop {
                let mut batch = match consumer.fetch().max_messages(FETCH_BATCH).messages().await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "fetch failed, ending subscription");
                        return;
                    }
                };
                let mut received = 0usize;
                while let Some(result) = batch.next().await {
                    let message = match result {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "receive error");
                            continue;
                        }
                    };
                    let envelope = match Envelope::from_bytes(&message.payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "undecodable message, TERMing");
                            let _ = message.ack_with(jetstream::AckKind::Term).await;
                            continue;
                        }
                    };
                    let delivery_count = message
                        .info()
                        .map(|i| i.delivered as u32)
                        .unwrap_or(1);
                    let properties = MessageProperties::for_envelope(&envelope);
                    let settler = Box::new(NatsSettler {
                        message,
                        jetstream: jetstream.clone(),
                        topic: topic.clone(),
                    });
                    let delivery = Delivery::new(envelope, properties, delivery_count, settler);
                    received += 1;
                    if tx.send(delivery).await.is_err() {
                        return; // consumer side went away
                    }
                }
                if received == 0 {
                    tokio::time::sleep(EMPTY_FETCH_PAUSE).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BusError> {
        envelope.validate()?;
        let properties = MessageProperties::for_envelope(envelope);
        let subject = subject_for(topic, &properties);
        let headers = properties_headers(&properties);
        let body = envelope.to_bytes()?;

        // The MessageId is fixed across attempts so the duplicate window
        // collapses retries that raced a slow broker ack.
        courier_common::retry::retry(&self.cfg.publish_retry, BusError::is_retriable, || {
            self.publish_once(&subject, &headers, &body)
        })
        .await
    }
}
