//! Routing engine: ingress HTTP surface, local forwarding and the
//! background request receiver.

pub mod forward;
pub mod ingress;
pub mod receiver;

use std::sync::Arc;
use std::time::Duration;

use courier_bus::BusAdapter;
use courier_common::ProxyId;
use courier_config::CourierConfig;

use crate::directory::AgentDirectory;
use crate::pending::PendingRegistry;
use forward::Forwarder;

/// Precomputed runtime knobs shared by every handler and task.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub proxy_id: ProxyId,
    /// Public base URL, used for agent-card rewriting.
    pub base_url: String,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    /// TTL stamped on every outgoing envelope, milliseconds.
    pub envelope_ttl_ms: u64,
}

impl RuntimeOptions {
    pub fn from_config(cfg: &CourierConfig) -> Self {
        Self {
            proxy_id: cfg.proxy_id(),
            base_url: cfg.proxy.base_url.trim_end_matches('/').to_string(),
            request_timeout: cfg.request_timeout(),
            stream_idle_timeout: cfg.stream_idle_timeout(),
            envelope_ttl_ms: cfg.limits.envelope_ttl_ms,
        }
    }
}

/// Shared state behind the axum router and the background tasks.
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<AgentDirectory>,
    pub registry: Arc<PendingRegistry>,
    pub bus: Arc<dyn BusAdapter>,
    pub forwarder: Forwarder,
    pub options: Arc<RuntimeOptions>,
}
