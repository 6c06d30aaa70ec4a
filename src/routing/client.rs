//! Backend forwarding client.
//!
//! # Collaborator Contract
//! ```text
//! POST {backend.base_url}/{operation}
//!     content-type: application/json
//!     x-request-id: <propagated>
//!     body: params
//! ```
//! Any status is returned to the router; only transport errors and timeouts fail here.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde_json::Value;
use thiserror::Error;

use crate::load_balancer::Backend;

const MAX_RESPONSE_BODY: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("invalid backend request: {0}")]
    InvalidRequest(String),

    #[error("failed to read backend response: {0}")]
    Body(String),
}

/// Buffered backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Pooled HTTP client with a per-call deadline.
#[derive(Clone)]
pub struct BackendClient {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client, timeout }
    }

    pub async fn forward(
        &self,
        backend: &Backend,
        operation: &str,
        params: &Value,
        request_id: Option<&str>,
    ) -> Result<BackendResponse, ForwardError> {
        let uri = format!("{}/{}", backend.base_url.as_str().trim_end_matches('/'), operation);
        let body = serde_json::to_vec(params).map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

        let mut builder = Request::builder()
            .method(hyper::Method::POST)
            .uri(&uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(id) = request_id {
            builder = builder.header("x-request-id", id);
        }
        let request = builder
            .body(Body::from(body))
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

        let call = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ForwardError::Transport(e.to_string()))?;

            let status = response.status();
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = axum::body::to_bytes(Body::new(response.into_body()), MAX_RESPONSE_BODY)
                .await
                .map_err(|e| ForwardError::Body(e.to_string()))?;

            Ok(BackendResponse {
                status,
                body,
                content_type,
            })
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ForwardError::Timeout(self.timeout))?
    }
}
