//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (dependencies and backend monitors name real services)
//! - Validate value ranges (thresholds > 0, addresses parse)
//! - Reject dependency cycles before anything is registered
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ControlPlaneConfig → Result<(), Vec<ValidationError>>

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ControlPlaneConfig;
use crate::registry::resolve_levels;

/// A single semantic problem, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ControlPlaneConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.api.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("api.bind_address", "not a valid socket address"));
    }
    if config.observability.metrics_enabled && config.observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("observability.metrics_address", "not a valid socket address"));
    }

    validate_services(config, &mut errors);
    validate_numbers(config, &mut errors);
    validate_backends(config, &mut errors);
    validate_cache(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_services(config: &ControlPlaneConfig, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for service in &config.services {
        if service.name.trim().is_empty() {
            errors.push(ValidationError::new("services.name", "must not be empty"));
        }
        if !seen.insert(service.name.as_str()) {
            errors.push(ValidationError::new(
                format!("services.{}", service.name),
                "duplicate service name",
            ));
        }
    }

    let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut graph_ok = true;
    for service in &config.services {
        let field = format!("services.{}.dependencies", service.name);
        for dep in &service.dependencies {
            if dep == &service.name {
                errors.push(ValidationError::new(&field, "service depends on itself"));
                graph_ok = false;
            } else if !seen.contains(dep.as_str()) {
                errors.push(ValidationError::new(&field, format!("unknown dependency '{dep}'")));
                graph_ok = false;
            }
        }
        if service.probe_interval_secs == Some(0) {
            errors.push(ValidationError::new(
                format!("services.{}.probe_interval_secs", service.name),
                "must be greater than 0",
            ));
        }
        for (name, command) in [
            ("start_command", &service.start_command),
            ("stop_command", &service.stop_command),
            ("kill_command", &service.kill_command),
        ] {
            if command.as_ref().is_some_and(|argv| argv.is_empty()) {
                errors.push(ValidationError::new(
                    format!("services.{}.{name}", service.name),
                    "command must not be empty",
                ));
            }
        }
        graph.insert(service.name.clone(), service.dependencies.iter().cloned().collect());
    }

    // Cycles are only meaningful once every edge points at a known service.
    if graph_ok {
        if let Err(cycle) = resolve_levels(&graph) {
            errors.push(ValidationError::new("services", cycle.to_string()));
        }
    }
}

fn validate_numbers(config: &ControlPlaneConfig, errors: &mut Vec<ValidationError>) {
    let checks = [
        ("api.request_timeout_secs", config.api.request_timeout_secs == 0),
        ("api.max_body_bytes", config.api.max_body_bytes == 0),
        ("health.interval_secs", config.health.interval_secs == 0),
        ("health.timeout_secs", config.health.timeout_secs == 0),
        ("health.unhealthy_threshold", config.health.unhealthy_threshold == 0),
        ("health.max_concurrent_probes", config.health.max_concurrent_probes == 0),
        ("health.history_len", config.health.history_len == 0),
        ("orchestrator.startup_timeout_secs", config.orchestrator.startup_timeout_secs == 0),
        ("recovery.max_retries", config.recovery.enabled && config.recovery.max_retries == 0),
        ("router.max_inflight", config.router.max_inflight == 0),
        ("router.request_timeout_secs", config.router.request_timeout_secs == 0),
        ("circuit_breaker.threshold", config.circuit_breaker.threshold == 0),
        ("circuit_breaker.window_secs", config.circuit_breaker.window_secs == 0),
        ("circuit_breaker.open_timeout_secs", config.circuit_breaker.open_timeout_secs == 0),
        ("cache.store_timeout_ms", config.cache.enabled && config.cache.store_timeout_ms == 0),
        ("cache.sweep_interval_secs", config.cache.enabled && config.cache.sweep_interval_secs == 0),
    ];
    for (field, invalid) in checks {
        if invalid {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }
}

fn validate_backends(config: &ControlPlaneConfig, errors: &mut Vec<ValidationError>) {
    let services: HashSet<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
    let mut ids = HashSet::new();

    for backend in &config.router.backends {
        let field = format!("router.backends.{}", backend.id);
        if !ids.insert(backend.id.as_str()) {
            errors.push(ValidationError::new(&field, "duplicate backend id"));
        }
        if url::Url::parse(&backend.address).is_err() {
            errors.push(ValidationError::new(
                format!("{field}.address"),
                format!("invalid URL '{}'", backend.address),
            ));
        }
        if backend.weight == 0 {
            errors.push(ValidationError::new(format!("{field}.weight"), "must be greater than 0"));
        }
        if backend.max_connections == 0 {
            errors.push(ValidationError::new(format!("{field}.max_connections"), "must be greater than 0"));
        }
        let monitor = backend.monitor_key();
        if !services.contains(monitor) {
            errors.push(ValidationError::new(
                format!("{field}.monitor"),
                format!("monitor '{monitor}' is not a registered service"),
            ));
        }
    }
}

fn validate_cache(config: &ControlPlaneConfig, errors: &mut Vec<ValidationError>) {
    for (i, policy) in config.cache.policies.iter().enumerate() {
        let field = format!("cache.policies[{i}]");
        if let Err(e) = glob::Pattern::new(&policy.pattern) {
            errors.push(ValidationError::new(format!("{field}.pattern"), e.to_string()));
        }
        if policy.cacheable && policy.ttl_secs == 0 {
            errors.push(ValidationError::new(format!("{field}.ttl_secs"), "must be greater than 0"));
        }
        for pattern in &policy.invalidates {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(ValidationError::new(format!("{field}.invalidates"), e.to_string()));
            }
        }
    }
}
