//! Proxy error taxonomy.
//!
//! Every client-visible failure maps to a JSON-RPC error code, an HTTP
//! status and a stable message. The bus side of a call never throws into
//! an HTTP handler; errors arrive through the pending registry and are
//! rendered here.

use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::Response;
use serde_json::Value;

use courier_common::{AgentId, CorrelationId};
use courier_bus::BusError;

use crate::jsonrpc::{self, codes};

/// Response header echoing the correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Client-visible proxy failures.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Agent not found: {agent}")]
    AgentNotFound { agent: AgentId },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Agent timeout")]
    UpstreamTimeout,

    #[error("Agent unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Bus publish failed: {0}")]
    BusPublish(#[from] BusError),

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Stream broken: {0}")]
    StreamBroken(String),
}

impl ProxyError {
    /// JSON-RPC error code for this failure.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            ProxyError::AgentNotFound { .. } => codes::NOT_FOUND,
            ProxyError::InvalidRequest(_) => codes::INVALID_REQUEST,
            ProxyError::UnsupportedOperation(_) => codes::UNSUPPORTED_OPERATION,
            ProxyError::UpstreamTimeout
            | ProxyError::UpstreamUnavailable(_)
            | ProxyError::BusPublish(_)
            | ProxyError::RequestTimeout
            | ProxyError::StreamBroken(_) => codes::INTERNAL_ERROR,
        }
    }

    /// HTTP status for this failure.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ProxyError::AgentNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::InvalidRequest(_) | ProxyError::UnsupportedOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::UpstreamTimeout | ProxyError::RequestTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BusPublish(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::StreamBroken(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable message surfaced in the JSON-RPC error object.
    pub fn client_message(&self) -> &'static str {
        match self {
            ProxyError::AgentNotFound { .. } => "Agent not found",
            ProxyError::InvalidRequest(_) => "Invalid request",
            ProxyError::UnsupportedOperation(_) => "Unsupported operation",
            ProxyError::UpstreamTimeout => "Agent timeout",
            ProxyError::UpstreamUnavailable(_) => "Agent unavailable",
            ProxyError::BusPublish(_) => "Bus publish failed",
            ProxyError::RequestTimeout => "Request timeout",
            ProxyError::StreamBroken(_) => "Stream out-of-order window exceeded",
        }
    }

    /// Render as the standard JSON-RPC error response.
    pub fn into_response(self, id: &Value, correlation: Option<&CorrelationId>) -> Response {
        let body = jsonrpc::error_body(id, self.jsonrpc_code(), self.client_message());
        json_response(self.http_status(), &body, correlation)
    }
}

/// Build a JSON response with the correlation id echoed.
pub fn json_response(
    status: StatusCode,
    body: &Value,
    correlation: Option<&CorrelationId>,
) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(axum::body::Body::from(bytes));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(correlation) = correlation {
        if let Ok(value) = HeaderValue::from_str(correlation.as_str()) {
            response.headers_mut().insert(CORRELATION_HEADER, value);
        }
    }
    response
}
