//! Typed configuration for the Courier proxy.
//!
//! Configuration is loaded from an optional TOML file layered with
//! `COURIER_`-prefixed environment variables, deserialized into the
//! structs below and validated before the proxy starts. Everything the
//! core needs is here: the proxy's identity and role, the HTTP listener,
//! the bus backend, timeout/buffer knobs and the static agent registry
//! the directory is built from.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

use courier_common::{AgentId, GroupId, ProxyId};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Static proxy role. The coordinator creates the bus topology once at
/// start-up; followers attach to what already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    #[default]
    Follower,
}

/// Which bus backend to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    #[default]
    Memory,
    Nats,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CourierConfig {
    #[validate(nested)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub limits: LimitSection,
    #[validate(length(min = 1, message = "at least one agent must be configured"))]
    pub agents: Vec<AgentSection>,
}

/// This proxy's identity and HTTP surface.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    /// Stable proxy id, used in subscription names and reply routing.
    #[validate(length(min = 1))]
    pub id: String,
    #[serde(default)]
    pub role: Role,
    /// Ingress listener, `ip:port`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Public base URL clients reach this proxy under; agent-card `url`
    /// fields are rewritten against it.
    #[validate(length(min = 1))]
    pub base_url: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// Bus backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusSection {
    #[serde(default)]
    pub backend: BusBackend,
    /// Broker URL; required for the `nats` backend.
    pub url: Option<String>,
}

/// Timeout knobs, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSection {
    /// Deadline for a synchronous cross-proxy request.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    /// Idle timer for streams, reset on each chunk.
    #[serde(default = "default_stream_idle_secs")]
    pub stream_idle_secs: u64,
    /// TCP connect timeout towards local agents.
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Total timeout for one local non-stream forward.
    #[serde(default = "default_forward_secs")]
    pub forward_secs: u64,
}

fn default_request_secs() -> u64 {
    30
}
fn default_stream_idle_secs() -> u64 {
    60
}
fn default_connect_secs() -> u64 {
    5
}
fn default_forward_secs() -> u64 {
    30
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            stream_idle_secs: default_stream_idle_secs(),
            connect_secs: default_connect_secs(),
            forward_secs: default_forward_secs(),
        }
    }
}

/// Buffer and retry knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitSection {
    /// Capacity of the ordered per-stream channel (high-water mark).
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Maximum out-of-order window in the reassembly buffer.
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,
    /// Publish attempts / delivery cap before dead-lettering.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Per-envelope TTL in milliseconds.
    #[serde(default = "default_envelope_ttl_ms")]
    pub envelope_ttl_ms: u64,
    /// Pending-registry sweeper interval in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Grace window for the terminated-correlation dedup set, seconds.
    #[serde(default = "default_terminated_grace_secs")]
    pub terminated_grace_secs: u64,
}

fn default_stream_buffer() -> usize {
    64
}
fn default_reorder_window() -> usize {
    256
}
fn default_max_retry_count() -> u32 {
    5
}
fn default_envelope_ttl_ms() -> u64 {
    60 * 60 * 1000
}
fn default_sweep_interval_ms() -> u64 {
    250
}
fn default_terminated_grace_secs() -> u64 {
    30
}

impl Default for LimitSection {
    fn default() -> Self {
        Self {
            stream_buffer: default_stream_buffer(),
            reorder_window: default_reorder_window(),
            max_retry_count: default_max_retry_count(),
            envelope_ttl_ms: default_envelope_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            terminated_grace_secs: default_terminated_grace_secs(),
        }
    }
}

/// One agent registry entry.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub group: String,
    /// Id of the proxy hosting this agent.
    #[validate(length(min = 1))]
    pub proxy: String,
    /// `host:port` of the local agent process; set only on its hosting
    /// proxy's configuration.
    pub endpoint: Option<String>,
    /// Where to fetch the agent card from; defaults to the endpoint.
    pub card_url: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl CourierConfig {
    /// Load from an optional TOML file plus `COURIER_` env overrides,
    /// then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("COURIER").separator("__"))
            .build()?;
        let cfg: CourierConfig = settings.try_deserialize()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Parse from a TOML string. Used by tests and embedded defaults.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?;
        let cfg: CourierConfig = settings.try_deserialize()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Field-level plus cross-field validation.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        self.listen_addr()?;

        if self.bus.backend == BusBackend::Nats && self.bus.url.is_none() {
            return Err(ConfigError::Invalid(
                "bus.url is required for the nats backend".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            agent.validate()?;
            if !seen.insert(agent.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
            if agent.proxy == self.proxy.id && agent.endpoint.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}' is hosted here but has no endpoint",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    pub fn proxy_id(&self) -> ProxyId {
        ProxyId::new(self.proxy.id.clone())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.proxy
            .listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{}'", self.proxy.listen)))
    }

    /// Agents hosted by this proxy.
    pub fn hosted_agents(&self) -> impl Iterator<Item = &AgentSection> {
        self.agents.iter().filter(|a| a.proxy == self.proxy.id)
    }

    /// Every group named by the registry, deduplicated.
    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = Vec::new();
        for agent in &self.agents {
            let group = GroupId::new(agent.group.clone());
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
        groups
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.stream_idle_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.forward_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.limits.sweep_interval_ms)
    }

    pub fn terminated_grace(&self) -> Duration {
        Duration::from_secs(self.limits.terminated_grace_secs)
    }
}

impl AgentSection {
    pub fn agent_id(&self) -> AgentId {
        AgentId::new(self.id.clone())
    }

    pub fn group_id(&self) -> GroupId {
        GroupId::new(self.group.clone())
    }

    pub fn proxy_id(&self) -> ProxyId {
        ProxyId::new(self.proxy.clone())
    }
}
