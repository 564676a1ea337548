//! In-memory session-ordered broker.
//!
//! A single-process implementation of the bus contract, used by tests,
//! local development and single-node deployments. It reproduces the
//! semantics the proxy depends on from a cloud bus:
//!
//! - **Topic/subscription fanout**: every matching subscription receives
//!   its own copy of a published message.
//! - **Session FIFO**: at most one unsettled message per session id is in
//!   flight per subscription; the next message of that session is held
//!   back until the previous one is settled. Distinct sessions interleave
//!   freely, so a slow stream only throttles itself.
//! - **Settlement**: ack removes, abandon requeues (dead-letters once the
//!   delivery cap is hit), dead-letter moves to the group's deadletter
//!   topic.
//! - **Duplicate detection**: recently-seen `MessageId`s inside the
//!   topic's window are dropped on publish.
//! - **TTL**: expired messages are discarded at dispatch time.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use async_trait::async_trait;
use courier_common::{now_ms, GroupId};

use crate::adapter::{
    BusAdapter, BusError, Delivery, DeliveryStream, MessageProperties, Selector, Settle, Settlement,
};
use crate::envelope::Envelope;
use crate::topology::{Topic, TopicKind, TopicSpec};

/// Retained deadletter messages per topic when nothing subscribes to the
/// deadletter topic (the common case).
const DEADLETTER_RETAIN_CAP: usize = 1024;

/// How long an idle dispatcher sleeps between liveness checks.
const DISPATCH_IDLE_TICK: Duration = Duration::from_millis(250);

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct MemoryBusConfig {
    /// Deliveries per message before an abandon dead-letters it.
    pub max_delivery_count: u32,
    /// Capacity of each subscription's consumer channel.
    pub delivery_buffer: usize,
    /// Upper bound on remembered `MessageId`s per topic.
    pub dedup_capacity: usize,
    /// Properties applied to topics created by `ensure_topology`.
    pub topic_spec: TopicSpec,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self {
            max_delivery_count: 5,
            delivery_buffer: 16,
            dedup_capacity: 4096,
            topic_spec: TopicSpec::default(),
        }
    }
}

/// In-process broker handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    cfg: MemoryBusConfig,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
}

struct TopicState {
    spec: TopicSpec,
    inner: Mutex<TopicInner>,
}

#[derive(Default)]
struct TopicInner {
    subscriptions: HashMap<String, Arc<SubscriptionState>>,
    /// Insertion-ordered (message_id, seen_at_ms) pairs for the
    /// duplicate-detection window.
    dedup: VecDeque<(String, u64)>,
    dedup_index: HashSet<String>,
    /// Deadletter topics retain messages that arrive with no subscriber.
    retained: VecDeque<(Envelope, MessageProperties)>,
}

struct SubscriptionState {
    name: String,
    topic: Topic,
    selector: Selector,
    bus: Weak<BusInner>,
    notify: Notify,
    inner: Mutex<SubscriptionInner>,
}

#[derive(Default)]
struct SubscriptionInner {
    queue: VecDeque<QueuedMessage>,
    inflight: HashMap<u64, QueuedMessage>,
    busy_sessions: HashSet<String>,
    consumer: Option<mpsc::Sender<Delivery>>,
    next_uid: u64,
}

#[derive(Clone)]
struct QueuedMessage {
    uid: u64,
    envelope: Envelope,
    properties: MessageProperties,
    /// Deliveries handed out so far, including the in-flight one.
    delivery_count: u32,
}

impl MemoryBus {
    pub fn new(cfg: MemoryBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                cfg,
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create one topic with explicit properties. `ensure_topology` is
    /// the normal path; this exists for operators (and tests) that need
    /// divergent per-topic settings. Returns false when the topic
    /// already existed.
    pub fn create_topic(&self, topic: &Topic, spec: TopicSpec) -> bool {
        let mut topics = self.inner.topics.lock();
        if topics.contains_key(&topic.name()) {
            return false;
        }
        topics.insert(
            topic.name(),
            Arc::new(TopicState {
                spec,
                inner: Mutex::new(TopicInner::default()),
            }),
        );
        true
    }

    /// Whether a topic exists.
    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.inner.topics.lock().contains_key(&topic.name())
    }

    /// Number of messages parked on a group's deadletter topic
    /// (retained ones plus those queued on deadletter subscriptions).
    pub fn deadletter_depth(&self, group: &GroupId) -> usize {
        let topic = Topic::deadletter(group);
        let Some(state) = self.topic_state(&topic) else {
            return 0;
        };
        let inner = state.inner.lock();
        let queued: usize = inner
            .subscriptions
            .values()
            .map(|s| s.inner.lock().queue.len())
            .sum();
        inner.retained.len() + queued
    }

    fn topic_state(&self, topic: &Topic) -> Option<Arc<TopicState>> {
        self.inner.topics.lock().get(&topic.name()).cloned()
    }

    fn publish_with_properties(
        &self,
        topic: &Topic,
        envelope: Envelope,
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        let state = self
            .topic_state(topic)
            .ok_or_else(|| BusError::TopicNotFound(topic.name()))?;
        fanout(&state, topic, envelope, properties, &self.inner.cfg);
        Ok(())
    }
}

/// Admit-or-suppress through the duplicate-detection window, then copy
/// the message into every matching subscription.
fn fanout(
    state: &TopicState,
    topic: &Topic,
    envelope: Envelope,
    properties: MessageProperties,
    cfg: &MemoryBusConfig,
) {
    let subscribers = {
        let mut inner = state.inner.lock();
        if !dedup_admit(
            &mut inner,
            &properties.message_id,
            state.spec.duplicate_window,
            cfg.dedup_capacity,
        ) {
            debug!(
                topic = %topic,
                message_id = %properties.message_id,
                "duplicate publish suppressed by detection window"
            );
            return;
        }

        let matching: Vec<Arc<SubscriptionState>> = inner
            .subscriptions
            .values()
            .filter(|s| s.selector.matches(&properties))
            .cloned()
            .collect();

        if matching.is_empty() && topic.kind() == TopicKind::Deadletter {
            inner
                .retained
                .push_back((envelope.clone(), properties.clone()));
            while inner.retained.len() > DEADLETTER_RETAIN_CAP {
                inner.retained.pop_front();
            }
        }
        matching
    };

    trace!(
        topic = %topic,
        correlation_id = %properties.correlation_id,
        message_type = properties.message_type,
        subscribers = subscribers.len(),
        "publish"
    );

    for subscription in subscribers {
        subscription.enqueue(envelope.clone(), properties.clone());
    }
}

fn dedup_admit(
    inner: &mut TopicInner,
    message_id: &str,
    window: Duration,
    capacity: usize,
) -> bool {
    let now = now_ms();
    let horizon = now.saturating_sub(window.as_millis() as u64);
    while let Some((id, seen)) = inner.dedup.front() {
        if *seen < horizon || inner.dedup.len() > capacity {
            let id = id.clone();
            inner.dedup.pop_front();
            inner.dedup_index.remove(&id);
        } else {
            break;
        }
    }
    if inner.dedup_index.contains(message_id) {
        return false;
    }
    inner.dedup.push_back((message_id.to_string(), now));
    inner.dedup_index.insert(message_id.to_string());
    true
}

impl SubscriptionState {
    fn enqueue(&self, envelope: Envelope, properties: MessageProperties) {
        {
            let mut inner = self.inner.lock();
            let uid = inner.next_uid;
            inner.next_uid += 1;
            inner.queue.push_back(QueuedMessage {
                uid,
                envelope,
                properties,
                delivery_count: 0,
            });
        }
        self.notify.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Per-subscription dispatch loop. Picks the oldest message whose session
/// is idle, marks the session busy and hands the message to the consumer
/// channel. Waiting on a full channel is exactly the back-pressure the
/// proxy relies on: the session stays busy until the delivery is settled.
fn spawn_dispatcher(subscription: Weak<SubscriptionState>) {
    tokio::spawn(async move {
        loop {
            let Some(sub) = subscription.upgrade() else {
                return;
            };

            let notified = sub.notify.notified();
            match take_dispatchable(&sub) {
                Some((delivery, tx)) => {
                    if let Err(returned) = tx.send(delivery).await {
                        // Consumer went away mid-handoff. Dropping the
                        // returned delivery abandons it, which requeues
                        // the message and frees its session.
                        drop(returned);
                        let mut inner = sub.inner.lock();
                        let stale = inner
                            .consumer
                            .as_ref()
                            .map(|c| c.same_channel(&tx))
                            .unwrap_or(true);
                        if stale {
                            inner.consumer = None;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(DISPATCH_IDLE_TICK) => {}
                    }
                }
            }
        }
    });
}

fn take_dispatchable(
    sub: &Arc<SubscriptionState>,
) -> Option<(Delivery, mpsc::Sender<Delivery>)> {
    let mut inner = sub.inner.lock();
    let tx = inner.consumer.clone()?;

    let now = now_ms();
    // Drop expired messages before considering dispatch order.
    let name = sub.name.clone();
    inner.queue.retain(|m| {
        let keep = !m.envelope.is_expired(now);
        if !keep {
            debug!(
                subscription = %name,
                correlation_id = %m.properties.correlation_id,
                "dropping expired message"
            );
        }
        keep
    });

    let position = {
        let busy = &inner.busy_sessions;
        inner
            .queue
            .iter()
            .position(|m| !busy.contains(&m.properties.session_id))?
    };
    let mut message = inner.queue.remove(position)?;
    message.delivery_count += 1;

    let uid = message.uid;
    inner
        .busy_sessions
        .insert(message.properties.session_id.clone());
    inner.inflight.insert(uid, message.clone());

    let settler = Box::new(MemorySettler {
        bus: Weak::clone(&sub.bus),
        subscription: Arc::downgrade(sub),
        uid,
    });
    let delivery = Delivery::new(
        message.envelope,
        message.properties,
        message.delivery_count,
        settler,
    );
    Some((delivery, tx))
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

struct MemorySettler {
    bus: Weak<BusInner>,
    subscription: Weak<SubscriptionState>,
    uid: u64,
}

impl MemorySettler {
    fn settle_sync(&self, outcome: Settlement) {
        let Some(sub) = self.subscription.upgrade() else {
            return;
        };
        let max_delivery = self
            .bus
            .upgrade()
            .map(|b| b.cfg.max_delivery_count)
            .unwrap_or(u32::MAX);

        let dead = {
            let mut inner = sub.inner.lock();
            let Some(message) = inner.inflight.remove(&self.uid) else {
                return; // already settled
            };
            inner.busy_sessions.remove(&message.properties.session_id);
            match outcome {
                Settlement::Ack => None,
                Settlement::Abandon => {
                    if message.delivery_count >= max_delivery {
                        Some((message, "delivery count exceeded".to_string()))
                    } else {
                        trace!(
                            subscription = %sub.name,
                            correlation_id = %message.properties.correlation_id,
                            delivery_count = message.delivery_count,
                            "message abandoned, requeueing"
                        );
                        inner.queue.push_front(message);
                        None
                    }
                }
                Settlement::DeadLetter { reason } => Some((message, reason)),
            }
        };

        if let Some((message, reason)) = dead {
            dead_letter(&self.bus, &sub.topic, message, &reason);
        }
        sub.notify.notify_one();
    }
}

#[async_trait]
impl Settle for MemorySettler {
    async fn settle(self: Box<Self>, outcome: Settlement) -> Result<(), BusError> {
        self.settle_sync(outcome);
        Ok(())
    }

    fn abandon_on_drop(&mut self) {
        self.settle_sync(Settlement::Abandon);
    }
}

fn dead_letter(bus: &Weak<BusInner>, origin: &Topic, message: QueuedMessage, reason: &str) {
    warn!(
        topic = %origin,
        correlation_id = %message.properties.correlation_id,
        reason,
        "dead-lettering message"
    );
    let Some(bus) = bus.upgrade() else {
        return;
    };
    let deadletter = origin.deadletter_peer();
    let Some(state) = bus.topics.lock().get(&deadletter.name()).cloned() else {
        warn!(topic = %deadletter, "deadletter topic missing, message dropped");
        return;
    };
    fanout(
        &state,
        &deadletter,
        message.envelope,
        message.properties,
        &bus.cfg,
    );
}

// ---------------------------------------------------------------------------
// Adapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl BusAdapter for MemoryBus {
    async fn ensure_topology(&self, groups: &[GroupId]) -> Result<(), BusError> {
        for group in groups {
            for topic in [
                Topic::requests(group),
                Topic::responses(group),
                Topic::deadletter(group),
            ] {
                let spec = self.inner.cfg.topic_spec.clone();
                if self.create_topic(&topic, spec.clone()) {
                    debug!(topic = %topic, "topic created");
                } else {
                    let existing = self
                        .topic_state(&topic)
                        .map(|s| s.spec.clone())
                        .unwrap_or_default();
                    if existing != spec {
                        warn!(
                            topic = %topic,
                            "topic exists with divergent properties, leaving untouched"
                        );
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
        let state = self
            .topic_state(topic)
            .ok_or_else(|| BusError::TopicNotFound(topic.name()))?;

        let (tx, rx) = mpsc::channel(self.inner.cfg.delivery_buffer);
        let sub = {
            let mut inner = state.inner.lock();
            match inner.subscriptions.get(subscription) {
                Some(existing) => {
                    existing.inner.lock().consumer = Some(tx);
                    existing.notify.notify_one();
                    existing.clone()
                }
                None => {
                    let sub = Arc::new(SubscriptionState {
                        name: subscription.to_string(),
                        topic: topic.clone(),
                        selector,
                        bus: Arc::downgrade(&self.inner),
                        notify: Notify::new(),
                        inner: Mutex::new(SubscriptionInner {
                            consumer: Some(tx),
                            ..Default::default()
                        }),
                    });
                    inner
                        .subscriptions
                        .insert(subscription.to_string(), sub.clone());
                    spawn_dispatcher(Arc::downgrade(&sub));
                    sub
                }
            }
        };

        debug!(
            topic = %topic,
            subscription = %sub.name,
            filter = %sub.selector.describe(),
            "subscription attached"
        );
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BusError> {
        envelope.validate()?;
        let properties = MessageProperties::for_envelope(envelope);
        self.publish_with_properties(topic, envelope.clone(), properties)
    }
}
