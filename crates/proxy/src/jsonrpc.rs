//! Minimal JSON-RPC 2.0 shapes used at the HTTP edge.
//!
//! The proxy never interprets method or params; it only needs enough
//! structure to extract request ids and to synthesise error responses in
//! the standard shape.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const VERSION: &str = "2.0";

/// JSON-RPC error codes used by the proxy.
pub mod codes {
    /// Agent or task not found.
    pub const NOT_FOUND: i64 = -32001;
    /// Malformed request or missing routing information.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Operation the proxy does not support.
    pub const UNSUPPORTED_OPERATION: i64 = -32004;
    /// Internal errors: timeouts, unavailable agents, bus failures.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Full error response body: `{"jsonrpc":"2.0","error":{…},"id":…}`.
pub fn error_body(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": VERSION,
        "error": ErrorObject::new(code, message),
        "id": id,
    })
}

/// The request id of a JSON-RPC body, or `null` when absent or the body
/// is not an object.
pub fn extract_id(payload: &Value) -> Value {
    payload.get("id").cloned().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = error_body(&json!("r3"), codes::INTERNAL_ERROR, "Request timeout");
        assert_eq!(
            body,
            json!({
                "jsonrpc": "2.0",
                "error": {"code": -32603, "message": "Request timeout"},
                "id": "r3",
            })
        );
    }

    #[test]
    fn test_not_found_body_shape() {
        let body = error_body(&Value::Null, codes::NOT_FOUND, "Agent not found");
        assert_eq!(
            body,
            json!({
                "jsonrpc": "2.0",
                "error": {"code": -32001, "message": "Agent not found"},
                "id": null,
            })
        );
    }

    #[test]
    fn test_extract_id() {
        assert_eq!(
            extract_id(&json!({"jsonrpc": "2.0", "id": "r1"})),
            json!("r1")
        );
        assert_eq!(extract_id(&json!({"jsonrpc": "2.0", "id": 7})), json!(7));
        assert_eq!(extract_id(&json!({"jsonrpc": "2.0"})), Value::Null);
        assert_eq!(extract_id(&json!("not an object")), Value::Null);
    }
}
