//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the axum router: control API plus the routed data path
//! - Wire up middleware (request id, tracing, body limit)
//! - Serve until the shutdown future resolves

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

use crate::admin::control_router;
use crate::http::request::{propagate_request_id, request_id, set_request_id, trace_layer};
use crate::http::response::ApiError;
use crate::lifecycle::ControlPlane;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_BACKEND: HeaderName = HeaderName::from_static("x-backend");

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
}

/// The control plane's HTTP API.
pub struct ApiServer {
    router: Router,
}

impl ApiServer {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self {
            router: build_router(plane),
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` resolves, then drain in-flight requests.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "API server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

/// Build the axum router with all middleware layers.
///
/// The request timeout is enforced by the router on the data path. Lifecycle
/// operations carry their own budgets.
pub fn build_router(plane: Arc<ControlPlane>) -> Router {
    let body_limit = plane.config().api.max_body_bytes;
    let state = AppState { plane };

    let data = Router::new().route("/route/{service}/{operation}", post(route_request));

    control_router(state.clone())
        .merge(data)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(set_request_id())
                .layer(propagate_request_id())
                .layer(trace_layer())
                .layer(RequestBodyLimitLayer::new(body_limit)),
        )
}

/// Data path: params in the JSON body, routed to a backend of `service`.
async fn route_request(
    State(state): State<AppState>,
    Path((service, operation)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let params: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("invalid JSON params: {e}")))?
    };

    let routed = state
        .plane
        .router
        .route(&service, &operation, params, request_id(&headers))
        .await?;

    let mut response = Response::builder().status(routed.status);
    if let Some(ct) = routed.content_type.as_deref().and_then(|ct| HeaderValue::from_str(ct).ok()) {
        response = response.header(header::CONTENT_TYPE, ct);
    }
    response = response.header(X_CACHE, routed.cache.as_str());
    if let Some(backend) = routed.backend.as_deref().and_then(|b| HeaderValue::from_str(b).ok()) {
        response = response.header(X_BACKEND, backend);
    }

    Ok(response
        .body(Body::from(routed.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}
