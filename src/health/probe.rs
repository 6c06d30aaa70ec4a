//! Health probes.
//!
//! # Collaborator Contract
//! ```text
//! GET <health_endpoint>
//!     2xx                          → Up
//!     2xx + {"status":"degraded"}  → Degraded
//!     non-2xx / connect error      → failure
//! ```
//! The caller bounds every probe with its own timeout.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

use crate::registry::ServiceDescriptor;

const MAX_HEALTH_BODY: usize = 64 * 1024;

/// A successful probe's signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSignal {
    Up,
    Degraded,
}

/// A failed probe. Always absorbed as one failure by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("health endpoint returned status {0}")]
    Status(u16),

    #[error("health check transport error: {0}")]
    Transport(String),

    #[error("invalid health endpoint '{0}'")]
    InvalidEndpoint(String),
}

/// Checks one service's health endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, service: &ServiceDescriptor) -> Result<ProbeSignal, ProbeError>;
}

/// HTTP probe over a shared pooled client.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector, Body>,
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, service: &ServiceDescriptor) -> Result<ProbeSignal, ProbeError> {
        let request = Request::builder()
            .method("GET")
            .uri(service.health_endpoint.as_str())
            .header("user-agent", "control-plane-health-check")
            .body(Body::empty())
            .map_err(|_| ProbeError::InvalidEndpoint(service.health_endpoint.clone()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let body = axum::body::to_bytes(Body::new(response.into_body()), MAX_HEALTH_BODY)
            .await
            .unwrap_or_default();
        Ok(parse_signal(&body))
    }
}

/// Interpret a 2xx health body.
pub(crate) fn parse_signal(body: &[u8]) -> ProbeSignal {
    let degraded = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(|s| s.eq_ignore_ascii_case("degraded")))
        .unwrap_or(false);
    if degraded {
        ProbeSignal::Degraded
    } else {
        ProbeSignal::Up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal(b"OK"), ProbeSignal::Up);
        assert_eq!(parse_signal(br#"{"status":"ok"}"#), ProbeSignal::Up);
        assert_eq!(parse_signal(br#"{"status":"Degraded"}"#), ProbeSignal::Degraded);
        assert_eq!(parse_signal(b""), ProbeSignal::Up);
    }
}
