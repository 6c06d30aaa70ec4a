//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend instance of a logical service
//! - Track in-flight requests (for Least Connections LB)
//! - Enforce max connection limits
//! - Mirror the health of the registered service that gates it

use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use url::Url;

use crate::config::BackendConfig;
use crate::health::HealthStatus;

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    /// Logical service this instance serves.
    pub service: String,
    /// Registered service whose health gates this backend.
    pub monitor: String,
    pub base_url: Url,
    pub weight: u32,
    /// Maximum concurrent requests allowed.
    pub max_connections: usize,
    /// Number of currently in-flight requests.
    pub active_connections: AtomicUsize,
    /// Current [`HealthStatus`] as its `u8` representation.
    health: AtomicU8,
}

impl Backend {
    pub fn new(id: impl Into<String>, service: impl Into<String>, base_url: Url) -> Self {
        let id = id.into();
        Self {
            monitor: id.clone(),
            id,
            service: service.into(),
            base_url,
            weight: 1,
            max_connections: 100,
            active_connections: AtomicUsize::new(0),
            health: AtomicU8::new(HealthStatus::Unknown as u8),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, url::ParseError> {
        let base_url = Url::parse(&config.address)?;
        Ok(Self::new(&config.id, &config.service, base_url)
            .with_weight(config.weight)
            .with_max_connections(config.max_connections)
            .with_monitor(config.monitor_key()))
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_monitor(mut self, monitor: impl Into<String>) -> Self {
        self.monitor = monitor.into();
        self
    }

    /// Get the current number of in-flight requests.
    pub fn connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Increment in-flight count.
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement in-flight count.
    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn has_capacity(&self) -> bool {
        self.connections() < self.max_connections
    }

    /// Try to create a connection guard that increments count.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<BackendConnectionGuard> {
        let mut prev = self.active_connections.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self
                .active_connections
                .compare_exchange_weak(prev, prev + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(BackendConnectionGuard { backend: self.clone() })
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from(self.health.load(Ordering::Relaxed))
    }

    pub fn set_health(&self, status: HealthStatus) {
        self.health.store(status as u8, Ordering::Relaxed);
    }

    /// Unknown and Degraded backends still take traffic.
    pub fn is_healthy(&self) -> bool {
        self.health() != HealthStatus::Unhealthy
    }

    pub fn candidate(&self) -> RoutingCandidate {
        RoutingCandidate {
            backend_id: self.id.clone(),
            weight: self.weight,
            active_connections: self.connections(),
        }
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            id: self.id.clone(),
            service: self.service.clone(),
            address: self.base_url.to_string(),
            health: self.health(),
            weight: self.weight,
            active_connections: self.connections(),
            max_connections: self.max_connections,
        }
    }
}

/// Point-in-time view of a selectable backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingCandidate {
    pub backend_id: String,
    pub weight: u32,
    pub active_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub id: String,
    pub service: String,
    pub address: String,
    pub health: HealthStatus,
    pub weight: u32,
    pub active_connections: usize,
    pub max_connections: usize,
}

/// A RAII guard that manages the in-flight count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    pub backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.dec_connections();
    }
}
