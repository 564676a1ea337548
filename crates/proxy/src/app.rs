//! Proxy assembly and lifecycle.
//!
//! Wires configuration into the running pieces: bus backend, agent
//! directory, pending registry (plus sweeper), ingress router and the
//! background receivers, then serves HTTP until a shutdown signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use courier_bus::{BusAdapter, BusError, MemoryBus, MemoryBusConfig, TopicSpec};
use courier_config::{BusBackend, ConfigError, CourierConfig, Role};

use crate::directory::AgentDirectory;
use crate::pending::{PendingRegistry, RegistryConfig};
use crate::routing::forward::{Forwarder, ForwardError};
use crate::routing::{ingress, receiver, AppState, RuntimeOptions};

/// Fatal start-up failures, mapped to process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("topology creation refused: {0}")]
    TopologyRefused(String),

    #[error("HTTP client error: {0}")]
    Forwarder(#[from] ForwardError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StartupError {
    /// Process exit code: 2 for a refused topology creation
    /// (coordinator role), 1 for every other fatal start-up failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::TopologyRefused(_) => 2,
            _ => 1,
        }
    }
}

/// Construct the configured bus backend.
pub async fn build_bus(cfg: &CourierConfig) -> Result<Arc<dyn BusAdapter>, StartupError> {
    match cfg.bus.backend {
        BusBackend::Memory => {
            let bus = MemoryBus::new(MemoryBusConfig {
                max_delivery_count: cfg.limits.max_retry_count,
                topic_spec: TopicSpec {
                    message_ttl: Duration::from_millis(cfg.limits.envelope_ttl_ms),
                    ..Default::default()
                },
                ..Default::default()
            });
            Ok(Arc::new(bus))
        }
        #[cfg(feature = "nats")]
        BusBackend::Nats => {
            use courier_bus::nats::{NatsBus, NatsBusConfig};
            use courier_common::RetryPolicy;
            let nats_cfg = NatsBusConfig {
                // Config validation guarantees the URL is present.
                url: cfg.bus.url.clone().unwrap_or_default(),
                max_delivery_count: cfg.limits.max_retry_count,
                publish_retry: RetryPolicy {
                    max_attempts: cfg.limits.max_retry_count,
                    ..RetryPolicy::default()
                },
                topic_spec: TopicSpec {
                    message_ttl: Duration::from_millis(cfg.limits.envelope_ttl_ms),
                    ..Default::default()
                },
                ..Default::default()
            };
            Ok(Arc::new(NatsBus::connect(nats_cfg).await?))
        }
        #[cfg(not(feature = "nats"))]
        BusBackend::Nats => Err(StartupError::Bus(BusError::BackendUnavailable(
            "built without the 'nats' feature",
        ))),
    }
}

/// One-shot topology creation, scoped to the coordinator role.
pub async fn ensure_topology(
    cfg: &CourierConfig,
    bus: &Arc<dyn BusAdapter>,
) -> Result<(), StartupError> {
    if cfg.proxy.role != Role::Coordinator {
        return Ok(());
    }
    let groups = cfg.groups();
    info!(groups = groups.len(), "coordinator creating bus topology");
    match bus.ensure_topology(&groups).await {
        Ok(()) => Ok(()),
        Err(BusError::PermissionDenied(reason)) => Err(StartupError::TopologyRefused(reason)),
        Err(e) => Err(StartupError::Bus(e)),
    }
}

/// A fully-wired proxy: shared state plus its background tasks.
pub struct App {
    state: AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Build from validated configuration and a connected bus.
    pub fn build(cfg: &CourierConfig, bus: Arc<dyn BusAdapter>) -> Result<Self, StartupError> {
        let options = Arc::new(RuntimeOptions::from_config(cfg));
        let directory = Arc::new(AgentDirectory::from_config(cfg));
        let registry = PendingRegistry::new(RegistryConfig {
            stream_buffer: cfg.limits.stream_buffer,
            reorder_window: cfg.limits.reorder_window,
            sweep_interval: cfg.sweep_interval(),
            terminated_grace: cfg.terminated_grace(),
        });
        let forwarder = Forwarder::new(cfg.connect_timeout(), cfg.forward_timeout())?;

        let state = AppState {
            directory,
            registry,
            bus,
            forwarder,
            options,
        };

        let mut tasks = vec![state.registry.spawn_sweeper()];
        tasks.extend(receiver::spawn_request_receivers(&state));
        tasks.extend(receiver::spawn_response_subscribers(&state));

        Ok(Self { state, tasks })
    }

    /// The ingress router over this app's state.
    pub fn router(&self) -> axum::Router {
        ingress::router(self.state.clone())
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Cancel in-flight waiters and stop background tasks.
    pub fn shutdown(&mut self) {
        self.state.registry.cancel_all("shutdown");
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run the proxy to completion: bind, serve, drain on signal.
pub async fn run(cfg: CourierConfig) -> Result<(), StartupError> {
    let bus = build_bus(&cfg).await?;
    ensure_topology(&cfg, &bus).await?;

    let mut app = App::build(&cfg, bus)?;
    let addr = cfg.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, proxy_id = %cfg.proxy.id, "courier proxy listening");

    axum::serve(listener, app.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app.shutdown();
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_bus::{DeliveryStream, Envelope, Selector, Topic};
    use courier_common::GroupId;

    fn config(role: &str) -> CourierConfig {
        CourierConfig::from_toml(&format!(
            r#"
            [proxy]
            id = "p1"
            role = "{role}"
            base_url = "http://p1"

            [[agents]]
            id = "critic"
            group = "g"
            proxy = "p2"
        "#
        ))
        .unwrap()
    }

    struct RefusingBus;

    #[async_trait]
    impl BusAdapter for RefusingBus {
        async fn ensure_topology(&self, _groups: &[GroupId]) -> Result<(), BusError> {
            Err(BusError::PermissionDenied("manage rights missing".into()))
        }

        async fn subscribe(
            &self,
            _topic: &Topic,
            _selector: Selector,
            _subscription: &str,
        ) -> Result<DeliveryStream, BusError> {
            Err(BusError::SubscriptionClosed)
        }

        async fn publish(&self, _topic: &Topic, _envelope: &Envelope) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            StartupError::TopologyRefused("denied".into()).exit_code(),
            2
        );
        assert_eq!(
            StartupError::Bus(BusError::SubscriptionClosed).exit_code(),
            1
        );
    }

    #[tokio::test]
    async fn test_coordinator_refusal_maps_to_exit_2() {
        let bus: Arc<dyn BusAdapter> = Arc::new(RefusingBus);
        let err = ensure_topology(&config("coordinator"), &bus)
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::TopologyRefused(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_follower_skips_topology() {
        let bus: Arc<dyn BusAdapter> = Arc::new(RefusingBus);
        assert!(ensure_topology(&config("follower"), &bus).await.is_ok());
    }

    #[tokio::test]
    async fn test_app_builds_on_memory_bus() {
        let cfg = config("coordinator");
        let bus = build_bus(&cfg).await.unwrap();
        ensure_topology(&cfg, &bus).await.unwrap();
        let app = App::build(&cfg, bus).unwrap();
        assert_eq!(app.state().options.proxy_id.as_str(), "p1");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
