//! Courier bus: envelope wire format and session-ordered bus adapters.
//!
//! The proxy's transport layer. [`Envelope`] is the sole payload format
//! on the bus; [`BusAdapter`] is the contract every backend implements;
//! [`memory::MemoryBus`] is the in-process broker used by tests and
//! single-node deployments; the `nats` feature adds a JetStream backend.

pub mod adapter;
pub mod envelope;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod topology;

pub use adapter::{
    BusAdapter, BusError, Delivery, DeliveryStream, MessageProperties, Selector, Settle, Settlement,
};
pub use envelope::{
    ChunkPayload, ChunkType, Envelope, EnvelopeBody, EnvelopeError, Headers, StreamMetadata,
    DEFAULT_TTL_MS, PROTOCOL_VERSION, STATUS_HEADER,
};
pub use memory::{MemoryBus, MemoryBusConfig};
pub use topology::{subscription_name, SubscriptionRole, Topic, TopicKind, TopicSpec};
