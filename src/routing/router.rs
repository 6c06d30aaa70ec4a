//! Request routing.
//!
//! # Responsibilities
//! - Shed load beyond `max_inflight` concurrent requests
//! - Serve cacheable operations from the cache
//! - Pick a backend, consult its circuit breaker, forward, report the outcome
//! - Fail over to the next candidate on failure
//!
//! # Design Decisions
//! - No global lock on the request path (semaphore permit, atomics, per-backend breaker)
//! - Circuit-open skips exclude the candidate without spending the failure budget
//! - 5xx and transport errors are failures; 4xx is the caller's answer

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::cache::{CacheManager, CacheStats, Fetched, WarmSource};
use crate::config::{ControlPlaneConfig, LoadBalancingStrategy};
use crate::load_balancer::{BackendPools, BackendStats};
use crate::observability::metrics;
use crate::resilience::{CircuitBreakerState, CircuitBreakers};
use crate::routing::client::BackendClient;
use crate::routing::stats::{RouterStats, RouterStatsSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("router overloaded: {limit} requests in flight")]
    Overloaded { limit: usize },

    #[error("no backend of '{service}' available after {attempts} failed calls{}", .last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    BackendUnavailable {
        service: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("request to '{service}' exceeded {after:?}")]
    Timeout { service: String, after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Operation has no cacheable policy.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Bypass => "bypass",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Backend that answered; `None` for cache hits.
    pub backend: Option<String>,
    pub cache: CacheStatus,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub max_retries: u32,
    pub max_inflight: usize,
    /// Per backend call.
    pub request_timeout: Duration,
    /// Whole request, cache and failover included.
    pub deadline: Duration,
}

impl From<&ControlPlaneConfig> for RouterSettings {
    fn from(config: &ControlPlaneConfig) -> Self {
        Self {
            max_retries: config.router.max_retries,
            max_inflight: config.router.max_inflight,
            request_timeout: Duration::from_secs(config.router.request_timeout_secs),
            deadline: Duration::from_secs(config.api.request_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterMetrics {
    pub strategy: LoadBalancingStrategy,
    pub inflight: usize,
    pub max_inflight: usize,
    pub stats: RouterStatsSnapshot,
    pub backends: Vec<BackendStats>,
    pub circuit_breakers: Vec<CircuitBreakerState>,
    pub cache: CacheStats,
}

pub struct RequestRouter {
    pools: Arc<BackendPools>,
    breakers: Arc<CircuitBreakers>,
    cache: Arc<CacheManager>,
    client: BackendClient,
    inflight: Semaphore,
    settings: RouterSettings,
    stats: RouterStats,
}

impl RequestRouter {
    pub fn new(
        pools: Arc<BackendPools>,
        breakers: Arc<CircuitBreakers>,
        cache: Arc<CacheManager>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            client: BackendClient::new(settings.request_timeout),
            inflight: Semaphore::new(settings.max_inflight),
            pools,
            breakers,
            cache,
            settings,
            stats: RouterStats::default(),
        }
    }

    pub fn pools(&self) -> &Arc<BackendPools> {
        &self.pools
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        self.pools.set_strategy(strategy);
    }

    /// Route one operation call for `service`.
    pub async fn route(
        &self,
        service: &str,
        operation: &str,
        params: Value,
        request_id: Option<&str>,
    ) -> Result<RoutedResponse, RouteError> {
        let _permit = self.inflight.try_acquire().map_err(|_| {
            self.stats.rejected();
            metrics::record_rejected(service);
            tracing::warn!(service = %service, limit = self.settings.max_inflight, "Router overloaded");
            RouteError::Overloaded {
                limit: self.settings.max_inflight,
            }
        })?;
        self.stats.request();

        if !self.pools.contains(service) {
            return Err(RouteError::UnknownService(service.to_string()));
        }

        let start = Instant::now();
        let deadline = self.settings.deadline;
        match tokio::time::timeout(deadline, self.serve(service, operation, params, request_id)).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.unavailable();
                metrics::record_routed(service, "none", "timeout", start);
                tracing::error!(service = %service, operation = %operation, after = ?deadline, "Request deadline exceeded");
                Err(RouteError::Timeout {
                    service: service.to_string(),
                    after: deadline,
                })
            }
        }
    }

    /// Cache lookup, dispatch, cache maintenance.
    async fn serve(
        &self,
        service: &str,
        operation: &str,
        params: Value,
        request_id: Option<&str>,
    ) -> Result<RoutedResponse, RouteError> {
        let policy = self.cache.policy_for(operation);
        let cacheable = self.cache.is_enabled() && policy.as_ref().is_some_and(|p| p.cacheable);
        let key = cacheable.then(|| self.cache.key(service, operation, &params));

        if let Some(key) = &key {
            if let Some(entry) = self.cache.lookup(key).await {
                self.stats.cache_hit();
                tracing::debug!(service = %service, operation = %operation, "Cache hit");
                return Ok(RoutedResponse {
                    status: entry.status,
                    body: entry.value,
                    content_type: entry.content_type,
                    backend: None,
                    cache: CacheStatus::Hit,
                });
            }
        }

        let mut response = self.dispatch(service, operation, &params, request_id).await?;

        if response.status.is_success() {
            match (&key, &policy) {
                (Some(key), Some(policy)) => {
                    let cached = Fetched {
                        status: response.status,
                        body: response.body.clone(),
                        content_type: response.content_type.clone(),
                    };
                    self.cache.store(key, cached, policy.ttl).await;
                }
                (None, Some(policy)) if !policy.invalidates.is_empty() => {
                    self.cache.invalidate_for(policy).await;
                }
                _ => {}
            }
        }

        response.cache = if key.is_some() {
            CacheStatus::Miss
        } else {
            CacheStatus::Bypass
        };
        Ok(response)
    }

    /// Backend path only: select, breaker check, forward, fail over.
    async fn dispatch(
        &self,
        service: &str,
        operation: &str,
        params: &Value,
        request_id: Option<&str>,
    ) -> Result<RoutedResponse, RouteError> {
        let start = Instant::now();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut failures = 0u32;
        let mut last_error = None;

        // One first call plus up to `max_retries` retries after failures.
        while failures <= self.settings.max_retries {
            let Some(backend) = self
                .pools
                .select(service, |b| !excluded.contains(&b.id) && self.breakers.is_routable(&b.id))
            else {
                break;
            };

            // Saturated between selection and acquisition.
            let Some(guard) = backend.try_create_guard() else {
                excluded.insert(backend.id.clone());
                continue;
            };

            let breaker = self.breakers.get(&backend.id);
            if let Err(e) = breaker.try_acquire() {
                self.stats.circuit_skip();
                tracing::debug!(service = %service, backend = %backend.id, "Skipping backend with open circuit");
                last_error = Some(e.to_string());
                excluded.insert(backend.id.clone());
                continue;
            }

            let error = match self.client.forward(&guard, operation, params, request_id).await {
                Ok(response) if !response.status.is_server_error() => {
                    breaker.record_success();
                    self.stats.backend_call(&backend.id, true);
                    metrics::record_routed(service, &backend.id, "success", start);
                    return Ok(RoutedResponse {
                        status: response.status,
                        body: response.body,
                        content_type: response.content_type,
                        backend: Some(backend.id.clone()),
                        cache: CacheStatus::Bypass,
                    });
                }
                Ok(response) => format!("backend '{}' returned {}", backend.id, response.status),
                Err(e) => format!("backend '{}': {e}", backend.id),
            };

            breaker.record_failure();
            self.stats.backend_call(&backend.id, false);
            metrics::record_routed(service, &backend.id, "failure", start);
            failures += 1;
            tracing::warn!(
                service = %service,
                operation = %operation,
                backend = %backend.id,
                attempt = failures,
                error = %error,
                "Backend call failed"
            );
            last_error = Some(error);
            excluded.insert(backend.id.clone());
        }

        self.stats.unavailable();
        metrics::record_routed(service, "none", "unavailable", start);
        tracing::error!(service = %service, operation = %operation, failures, "No backend available");
        Err(RouteError::BackendUnavailable {
            service: service.to_string(),
            attempts: failures,
            last_error,
        })
    }

    pub async fn metrics(&self) -> RouterMetrics {
        RouterMetrics {
            strategy: self.pools.strategy(),
            inflight: self.settings.max_inflight.saturating_sub(self.inflight.available_permits()),
            max_inflight: self.settings.max_inflight,
            stats: self.stats.snapshot(),
            backends: self.pools.stats(),
            circuit_breakers: self.breakers.snapshot(),
            cache: self.cache.stats().await,
        }
    }
}

#[async_trait]
impl WarmSource for RequestRouter {
    async fn fetch(&self, service: &str, operation: &str, params: &Value) -> Result<Fetched, String> {
        if !self.pools.contains(service) {
            return Err(RouteError::UnknownService(service.to_string()).to_string());
        }
        let response = self
            .dispatch(service, operation, params, None)
            .await
            .map_err(|e| e.to_string())?;
        if !response.status.is_success() {
            return Err(format!("backend returned {}", response.status));
        }
        Ok(Fetched {
            status: response.status,
            body: response.body,
            content_type: response.content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::load_balancer::Backend;
    use crate::resilience::BreakerSettings;
    use url::Url;

    fn router(max_inflight: usize) -> RequestRouter {
        // Nothing listens on port 9; every call fails at the transport.
        let backend = Backend::new("dead", "ai", Url::parse("http://127.0.0.1:9").unwrap());
        RequestRouter::new(
            Arc::new(BackendPools::new(vec![backend], LoadBalancingStrategy::RoundRobin)),
            Arc::new(CircuitBreakers::new(BreakerSettings::default())),
            Arc::new(CacheManager::in_memory(&CacheConfig::default()).unwrap()),
            RouterSettings {
                max_retries: 3,
                max_inflight,
                request_timeout: Duration::from_secs(1),
                deadline: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_overloaded_rejects_immediately() {
        let router = router(1);
        let _held = router.inflight.try_acquire().unwrap();

        let err = router.route("ai", "get", Value::Null, None).await.unwrap_err();
        assert_eq!(err, RouteError::Overloaded { limit: 1 });
        assert_eq!(router.metrics().await.stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let router = router(10);
        let err = router.route("nope", "get", Value::Null, None).await.unwrap_err();
        assert_eq!(err, RouteError::UnknownService("nope".into()));
    }

    #[tokio::test]
    async fn test_single_dead_backend_is_unavailable_after_one_failure() {
        let router = router(10);
        let err = router.route("ai", "get", Value::Null, None).await.unwrap_err();
        match err {
            RouteError::BackendUnavailable { attempts, last_error, .. } => {
                assert_eq!(attempts, 1, "excluded backend is not retried");
                assert!(last_error.unwrap().contains("dead"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(router.metrics().await.inflight, 0);
    }
}
