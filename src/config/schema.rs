//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the control plane.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::registry::{ServiceKind, ServiceSpec};

/// Root configuration for the control plane.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Control API listener and authentication.
    pub api: ApiConfig,

    /// Managed services and their dependency graph.
    pub services: Vec<ServiceConfig>,

    /// Health monitor settings.
    pub health: HealthCheckConfig,

    /// Startup/shutdown orchestration.
    pub orchestrator: OrchestratorConfig,

    /// Automatic recovery of failed services.
    pub recovery: RecoveryConfig,

    /// Request routing and backend definitions.
    pub router: RouterConfig,

    /// Per-backend circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Response cache.
    pub cache: CacheConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Control API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:7070").
    pub bind_address: String,

    /// Bearer token required on control endpoints. Unset disables auth.
    pub api_key: Option<String>,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7070".to_string(),
            api_key: None,
            request_timeout_secs: 30,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// One managed service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Unique service name.
    pub name: String,

    pub kind: ServiceKind,

    /// Request-forwarding endpoint (e.g., "http://127.0.0.1:5432").
    pub endpoint: Option<String>,

    /// Health endpoint. Defaults to `{endpoint}/health`.
    pub health_endpoint: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Critical services must be fully Healthy to satisfy dependents.
    #[serde(default)]
    pub critical: bool,

    /// Probe interval override in seconds.
    pub probe_interval_secs: Option<u64>,

    /// Graceful drain override in seconds.
    pub drain_timeout_secs: Option<u64>,

    /// Argv run to start the service.
    pub start_command: Option<Vec<String>>,

    /// Argv run for a graceful stop.
    pub stop_command: Option<Vec<String>>,

    /// Argv run when the drain timeout expires.
    pub kill_command: Option<Vec<String>>,
}

impl ServiceConfig {
    pub fn to_spec(&self) -> ServiceSpec {
        let mut spec = ServiceSpec::new(&self.name, self.kind)
            .depends_on(self.dependencies.iter().cloned())
            .critical(self.critical);

        if let Some(endpoint) = &self.endpoint {
            let endpoint = endpoint.trim_end_matches('/');
            let health = self
                .health_endpoint
                .clone()
                .unwrap_or_else(|| format!("{endpoint}/health"));
            spec = spec.with_endpoints(endpoint, health);
        } else if let Some(health) = &self.health_endpoint {
            let endpoint = spec.endpoint.clone();
            spec = spec.with_endpoints(endpoint, health.clone());
        }

        spec.probe_interval_secs = self.probe_interval_secs;
        spec.drain_timeout_secs = self.drain_timeout_secs;
        spec
    }

    pub fn has_commands(&self) -> bool {
        self.start_command.is_some() || self.stop_command.is_some() || self.kill_command.is_some()
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Cap on simultaneous in-flight probes across all services.
    pub max_concurrent_probes: usize,

    /// Results retained per service.
    pub history_len: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            unhealthy_threshold: 3,
            max_concurrent_probes: 32,
            history_len: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Total budget for one startup operation.
    pub startup_timeout_secs: u64,

    /// Default graceful drain before force stop.
    pub drain_timeout_secs: u64,

    /// Run startup for all services once the process is up.
    pub auto_startup: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 300,
            drain_timeout_secs: 30,
            auto_startup: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,

    /// Attempts before the service is quarantined.
    pub max_retries: u32,

    /// Delay between attempts in seconds.
    pub delay_secs: u64,

    /// Double the delay after each failed attempt.
    pub exponential: bool,

    /// Cap for exponential delays in seconds.
    pub max_delay_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            delay_secs: 60,
            exponential: false,
            max_delay_secs: 600,
        }
    }
}

/// Load balancing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRandom,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRandom => "weighted_random",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "weighted_random" => Ok(Self::WeightedRandom),
            other => Err(format!("unknown load balancing strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    pub strategy: LoadBalancingStrategy,

    /// Call failures tolerated per request before giving up.
    pub max_retries: u32,

    /// Concurrent routed requests before shedding load.
    pub max_inflight: usize,

    /// Per-call backend timeout in seconds.
    pub request_timeout_secs: u64,

    /// Backend instances, grouped by logical service.
    pub backends: Vec<BackendConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            max_retries: 3,
            max_inflight: 1000,
            request_timeout_secs: 30,
            backends: Vec::new(),
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub id: String,

    /// Logical service this instance serves.
    pub service: String,

    /// Base URL (e.g., "http://127.0.0.1:3000").
    pub address: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Maximum concurrent requests to this backend.
    #[serde(default = "default_max_backend_conns")]
    pub max_connections: usize,

    /// Registered service whose health gates this backend. Defaults to `id`.
    pub monitor: Option<String>,
}

impl BackendConfig {
    pub fn monitor_key(&self) -> &str {
        self.monitor.as_deref().unwrap_or(&self.id)
    }
}

fn default_weight() -> u32 {
    1
}

fn default_max_backend_conns() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit.
    pub threshold: u32,

    /// Rolling failure window in seconds.
    pub window_secs: u64,

    /// Time spent open before a trial call.
    pub open_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            window_secs: 60,
            open_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Bound on a single store operation in milliseconds.
    pub store_timeout_ms: u64,

    /// Interval of the expired-entry sweeper.
    pub sweep_interval_secs: u64,

    /// Operation policies, first match wins.
    pub policies: Vec<CachePolicyConfig>,

    /// Warming queries per service. Warming a service with none configured,
    /// and none supplied in the request, is rejected.
    pub samples: BTreeMap<String, Vec<CacheSample>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_timeout_ms: 100,
            sweep_interval_secs: 60,
            policies: Vec::new(),
            samples: BTreeMap::new(),
        }
    }
}

/// Caching rules for operations matching a glob pattern.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CachePolicyConfig {
    /// Glob over operation names (e.g., "get_*").
    pub pattern: String,

    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cacheable")]
    pub cacheable: bool,

    /// Key patterns invalidated after a successful call.
    #[serde(default)]
    pub invalidates: Vec<String>,
}

fn default_ttl() -> u64 {
    300
}

fn default_cacheable() -> bool {
    true
}

/// A stored warming query.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSample {
    pub operation: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: ControlPlaneConfig = toml::from_str(
            r#"
            [[services]]
            name = "db"
            kind = "database"
            endpoint = "http://127.0.0.1:5432/"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.bind_address, "0.0.0.0:7070");
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.router.strategy, LoadBalancingStrategy::RoundRobin);

        let spec = config.services[0].to_spec();
        assert_eq!(spec.endpoint, "http://127.0.0.1:5432");
        assert_eq!(spec.health_endpoint, "http://127.0.0.1:5432/health");
    }

    #[test]
    fn test_cache_samples_and_backends() {
        let config: ControlPlaneConfig = toml::from_str(
            r#"
            [router]
            strategy = "least_connections"

            [[router.backends]]
            id = "ai-1"
            service = "ai"
            address = "http://127.0.0.1:9001"
            monitor = "ai"

            [[cache.policies]]
            pattern = "get_*"
            ttl_secs = 60

            [[cache.samples.ai]]
            operation = "get_model"
            params = { name = "small" }
            "#,
        )
        .unwrap();

        assert_eq!(config.router.strategy, LoadBalancingStrategy::LeastConnections);
        assert_eq!(config.router.backends[0].weight, 1);
        assert_eq!(config.router.backends[0].monitor_key(), "ai");
        assert!(config.cache.policies[0].cacheable);
        assert_eq!(config.cache.samples["ai"][0].params["name"], "small");
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "weighted_random".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::WeightedRandom
        );
        assert!("random".parse::<LoadBalancingStrategy>().is_err());
    }
}
