//! Local HTTP forwarding.
//!
//! Requests addressed to a locally-hosted agent are re-issued over a
//! shared, pooled HTTP client: method preserved, URL rewritten to the
//! agent's endpoint, headers copied minus hop-by-hop, body re-serialised
//! from the envelope payload. Forwarding is never retried; requests may
//! be non-idempotent.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use courier_bus::Headers;

/// Idle connections kept per host.
const POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Idle timeout before a pooled connection is closed.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Forwarding failures, classified for the §7 error mapping.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Connect refused, DNS failure, connection reset.
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    /// The agent exceeded the forward timeout.
    #[error("agent timeout")]
    Timeout,

    /// The request could not be constructed or the body not read.
    #[error("invalid forward: {0}")]
    Invalid(String),
}

impl ForwardError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout
        } else {
            ForwardError::Unavailable(e.to_string())
        }
    }
}

/// Shared pooled HTTP client towards local agents.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    forward_timeout: Duration,
}

impl Forwarder {
    pub fn new(connect_timeout: Duration, forward_timeout: Duration) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|e| ForwardError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            client,
            forward_timeout,
        })
    }

    /// Forward one wrapped request to `http://{endpoint}{path}`. With
    /// `streaming` set no total timeout is applied (streams are bounded
    /// by the caller's idle timer instead).
    pub async fn forward(
        &self,
        endpoint: &str,
        method: &str,
        path: &str,
        headers: &Headers,
        payload: &Value,
        streaming: bool,
    ) -> Result<reqwest::Response, ForwardError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ForwardError::Invalid(format!("invalid method '{method}'")))?;
        let url = format!("http://{endpoint}{path}");
        trace!(%url, "forwarding to local agent");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(to_header_map(headers));
        if !payload.is_null() {
            request = request.json(payload);
        }
        if !streaming {
            request = request.timeout(self.forward_timeout);
        }

        let response = request.send().await.map_err(ForwardError::from_reqwest)?;
        debug!(%url, status = %response.status(), "local agent responded");
        Ok(response)
    }

    /// Fetch an agent-card document.
    pub async fn fetch_card(&self, url: &str) -> Result<Value, ForwardError> {
        let response = self
            .client
            .get(url)
            .timeout(self.forward_timeout)
            .send()
            .await
            .map_err(ForwardError::from_reqwest)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| ForwardError::Invalid(format!("card body: {e}")))
    }
}

/// Convert envelope headers to a reqwest header map, skipping the
/// connection-scoped names the client manages itself.
fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        if Headers::is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        map.insert(name, value);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_conversion_filters() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");
        headers.insert("Authorization", "Bearer t");
        headers.insert("Host", "example.com");
        headers.insert("Content-Length", "42");

        let map = to_header_map(&headers);
        assert_eq!(map.get("content-type").unwrap(), "application/json");
        assert_eq!(map.get("authorization").unwrap(), "Bearer t");
        assert!(map.get("host").is_none());
        assert!(map.get("content-length").is_none());
    }

    #[test]
    fn test_invalid_method_rejected() {
        let forwarder = Forwarder::new(Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        let err = futures::executor::block_on(forwarder.forward(
            "127.0.0.1:1",
            "BAD METHOD",
            "/v1/messages:send",
            &Headers::new(),
            &Value::Null,
            false,
        ))
        .unwrap_err();
        assert!(matches!(err, ForwardError::Invalid(_)));
    }
}
