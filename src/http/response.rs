//! API error responses.
//!
//! Every failure leaves the API as `{"error": kind, "target": name, "message": text}`
//! with a status chosen from the error; `details` carries an operation report when one exists.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use crate::cache::CacheError;
use crate::lifecycle::{OrchestratorError, Outcome};
use crate::registry::RegistryError;
use crate::routing::RouteError;

/// Seconds a shed client should wait before retrying.
const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub target: Option<String>,
    pub message: String,
    pub details: Option<Value>,
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            target: None,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid bearer token")
    }

    pub fn not_found(kind: &'static str, target: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, kind, format!("'{target}' not found")).with_target(target)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind,
            target: self.target.as_deref(),
            message: &self.message,
            details: self.details.as_ref(),
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let message = e.to_string();
        match e {
            RegistryError::NotFound(name) => Self::new(StatusCode::NOT_FOUND, "service_not_found", message).with_target(name),
            RegistryError::DependencyUnhealthy { dependency, .. } => {
                Self::new(StatusCode::CONFLICT, "dependency_unhealthy", message).with_target(dependency)
            }
            RegistryError::HasDependents { service, .. } => {
                Self::new(StatusCode::CONFLICT, "has_dependents", message).with_target(service)
            }
            RegistryError::Duplicate(name) => Self::new(StatusCode::CONFLICT, "duplicate_service", message).with_target(name),
            RegistryError::Cycle(_) => Self::new(StatusCode::BAD_REQUEST, "dependency_cycle", message),
            RegistryError::SelfDependency(name) | RegistryError::UnknownDependency { service: name, .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_dependency", message).with_target(name)
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let message = e.to_string();
        match e {
            OrchestratorError::Registry(e) => e.into(),
            OrchestratorError::OperationFailed { failed, report, .. } => {
                let timed_out = report.services.iter().any(|s| s.outcome == Outcome::TimedOut);
                let (status, kind) = if timed_out {
                    (StatusCode::GATEWAY_TIMEOUT, "operation_timeout")
                } else {
                    (StatusCode::BAD_GATEWAY, "operation_failed")
                };
                let mut error = Self::new(status, kind, message);
                error.target = failed.first().cloned();
                error.details = serde_json::to_value(&*report).ok();
                error
            }
        }
    }
}

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        let message = e.to_string();
        match e {
            RouteError::UnknownService(service) => {
                Self::new(StatusCode::NOT_FOUND, "service_not_found", message).with_target(service)
            }
            RouteError::Overloaded { .. } => {
                let mut error = Self::new(StatusCode::SERVICE_UNAVAILABLE, "overloaded", message);
                error.retry_after = Some(RETRY_AFTER_SECS);
                error
            }
            RouteError::BackendUnavailable { service, .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "backend_unavailable", message).with_target(service)
            }
            RouteError::Timeout { service, .. } => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "request_timeout", message).with_target(service)
            }
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        let message = e.to_string();
        match e {
            CacheError::InvalidPattern { pattern, .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_pattern", message).with_target(pattern)
            }
            CacheError::Disabled => Self::new(StatusCode::CONFLICT, "cache_disabled", message),
            CacheError::NoWarmQueries(service) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "no_warm_queries", message).with_target(service)
            }
            CacheError::Timeout(_) => Self::new(StatusCode::GATEWAY_TIMEOUT, "cache_timeout", message),
        }
    }
}
