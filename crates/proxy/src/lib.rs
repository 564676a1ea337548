//! Courier proxy: transparent A2A transport over a message bus.
//!
//! Agents speak plain JSON-RPC 2.0 over HTTP (with SSE streams) to
//! their local proxy; pairs of proxies relay the traffic through a
//! session-ordered bus, preserving JSON-RPC semantics, task lifecycle
//! and streaming behaviour end to end.

pub mod app;
pub mod directory;
pub mod errors;
pub mod jsonrpc;
pub mod pending;
pub mod routing;
pub mod sse;

pub use app::{App, StartupError};
pub use directory::{AgentDirectory, AgentEntry};
pub use errors::ProxyError;
pub use pending::{PendingRegistry, RegistryConfig, RegistryStats};
pub use routing::{AppState, RuntimeOptions};
