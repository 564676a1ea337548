//! The bus adapter contract.
//!
//! A backend provides three operations: idempotent topology creation,
//! filtered subscription with explicit settlement, and session-keyed
//! publish. Messages published with the same session id (the envelope's
//! correlation id) are delivered to a single receiver in publish order.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use uuid::Uuid;

use courier_common::{AgentId, CorrelationId, GroupId, ProxyId};

use crate::envelope::{Envelope, EnvelopeError};
use crate::topology::Topic;

/// Bus adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Insufficient permission: {0}")]
    PermissionDenied(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Backend not compiled in: {0}")]
    BackendUnavailable(&'static str),
}

impl BusError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::PublishFailed(_))
    }
}

/// Server-side subscription filter. Mirrors the user properties stamped
/// on every published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// No filtering; every message on the topic matches.
    All,
    /// `toAgent = '<id>'`
    ToAgent(AgentId),
    /// `toProxy = '<id>'`
    ToProxy(ProxyId),
    /// `correlationId = '<uuid>'`
    Correlation(CorrelationId),
}

impl Selector {
    pub fn matches(&self, properties: &MessageProperties) -> bool {
        match self {
            Selector::All => true,
            Selector::ToAgent(agent) => properties.to_agent == *agent,
            Selector::ToProxy(proxy) => properties.to_proxy.as_ref() == Some(proxy),
            Selector::Correlation(correlation) => properties.correlation_id == *correlation,
        }
    }

    /// Human-readable filter expression, for logs.
    pub fn describe(&self) -> String {
        match self {
            Selector::All => "1 = 1".to_string(),
            Selector::ToAgent(agent) => format!("toAgent = '{agent}'"),
            Selector::ToProxy(proxy) => format!("toProxy = '{proxy}'"),
            Selector::Correlation(correlation) => format!("correlationId = '{correlation}'"),
        }
    }
}

/// Broker-level message metadata: system properties plus the user
/// properties server-side filters evaluate against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    /// Fresh UUID per publish; duplicate detection keys on it.
    pub message_id: String,
    pub correlation_id: CorrelationId,
    /// Session key; equal to the correlation id for FIFO per correlation.
    pub session_id: String,
    pub content_type: &'static str,
    pub to_agent: AgentId,
    pub from_agent: AgentId,
    pub group: GroupId,
    pub to_proxy: Option<ProxyId>,
    /// Wire name of the envelope kind.
    pub message_type: &'static str,
}

impl MessageProperties {
    /// Stamp properties for one publish of `envelope`.
    pub fn for_envelope(envelope: &Envelope) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: envelope.correlation_id.clone(),
            session_id: envelope.correlation_id.to_string(),
            content_type: "application/json",
            to_agent: envelope.to_agent.clone(),
            from_agent: envelope.from_agent.clone(),
            group: envelope.group.clone(),
            to_proxy: envelope.to_proxy().cloned(),
            message_type: envelope.kind_name(),
        }
    }
}

/// How a received message is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Processing succeeded; remove the message.
    Ack,
    /// Retriable failure; return to the queue (dead-letters after the
    /// delivery cap).
    Abandon,
    /// Poison message; move to the deadletter topic.
    DeadLetter { reason: String },
}

/// Backend hook behind [`Delivery`].
#[async_trait]
pub trait Settle: Send {
    async fn settle(self: Box<Self>, outcome: Settlement) -> Result<(), BusError>;

    /// Best-effort synchronous abandon, used when a delivery is dropped
    /// without being settled.
    fn abandon_on_drop(&mut self);
}

/// One received message plus its settlement handle. Exactly one of
/// [`ack`](Delivery::ack), [`abandon`](Delivery::abandon) or
/// [`dead_letter`](Delivery::dead_letter) must be called; dropping the
/// delivery unsettled abandons it.
pub struct Delivery {
    pub envelope: Envelope,
    pub properties: MessageProperties,
    /// 1 on first delivery, incremented by each abandon.
    pub delivery_count: u32,
    settler: Option<Box<dyn Settle>>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        properties: MessageProperties,
        delivery_count: u32,
        settler: Box<dyn Settle>,
    ) -> Self {
        Self {
            envelope,
            properties,
            delivery_count,
            settler: Some(settler),
        }
    }

    pub async fn ack(mut self) -> Result<(), BusError> {
        match self.settler.take() {
            Some(s) => s.settle(Settlement::Ack).await,
            None => Ok(()),
        }
    }

    pub async fn abandon(mut self) -> Result<(), BusError> {
        match self.settler.take() {
            Some(s) => s.settle(Settlement::Abandon).await,
            None => Ok(()),
        }
    }

    pub async fn dead_letter(mut self, reason: impl Into<String>) -> Result<(), BusError> {
        match self.settler.take() {
            Some(s) => {
                s.settle(Settlement::DeadLetter {
                    reason: reason.into(),
                })
                .await
            }
            None => Ok(()),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(settler) = self.settler.as_mut() {
            settler.abandon_on_drop();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("correlation_id", &self.properties.correlation_id)
            .field("message_type", &self.properties.message_type)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Stream of deliveries from one subscription. Ends when the
/// subscription is torn down or the backend connection is lost; callers
/// re-subscribe with bounded backoff.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// The C1 contract every backend implements.
#[async_trait]
pub trait BusAdapter: Send + Sync + 'static {
    /// Idempotently create the topic triple for each group. Topics that
    /// already exist with divergent properties are left untouched and a
    /// warning is logged.
    async fn ensure_topology(&self, groups: &[GroupId]) -> Result<(), BusError>;

    /// Create or attach to the durable subscription `subscription` on
    /// `topic`, filtered server-side by `selector`.
    async fn subscribe(
        &self,
        topic: &Topic,
        selector: Selector,
        subscription: &str,
    ) -> Result<DeliveryStream, BusError>;

    /// Publish `envelope` to `topic` with the session key set to the
    /// correlation id. Retries transient failures with backoff before
    /// surfacing an error.
    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Headers, DEFAULT_TTL_MS};
    use serde_json::json;

    fn sample_request() -> Envelope {
        Envelope::request(
            GroupId::new("g"),
            AgentId::new("critic"),
            AgentId::new("proxy"),
            CorrelationId::from_string("c-1"),
            ProxyId::new("p1"),
            "POST",
            "/v1/messages:send",
            false,
            Headers::new(),
            json!({}),
            DEFAULT_TTL_MS,
        )
    }

    #[test]
    fn test_properties_for_request() {
        let envelope = sample_request();
        let props = MessageProperties::for_envelope(&envelope);
        assert_eq!(props.session_id, "c-1");
        assert_eq!(props.message_type, "request");
        assert_eq!(props.to_proxy, None);
        assert_eq!(props.content_type, "application/json");
    }

    #[test]
    fn test_selector_matching() {
        let envelope = sample_request();
        let reply = Envelope::reply(&envelope, ProxyId::new("p1"), Headers::new(), json!({}));
        let props = MessageProperties::for_envelope(&reply);

        assert!(Selector::All.matches(&props));
        assert!(Selector::ToProxy(ProxyId::new("p1")).matches(&props));
        assert!(!Selector::ToProxy(ProxyId::new("p2")).matches(&props));
        assert!(Selector::Correlation(CorrelationId::from_string("c-1")).matches(&props));
        assert!(Selector::ToAgent(AgentId::new("proxy")).matches(&props));
        assert!(!Selector::ToAgent(AgentId::new("critic")).matches(&props));
    }

    #[test]
    fn test_selector_describe() {
        assert_eq!(
            Selector::ToAgent(AgentId::new("critic")).describe(),
            "toAgent = 'critic'"
        );
        assert_eq!(
            Selector::Correlation(CorrelationId::from_string("u")).describe(),
            "correlationId = 'u'"
        );
    }
}
