//! Backend pool management.
//!
//! # Responsibilities
//! - Group backends by logical service
//! - Apply the current load balancing strategy to eligible backends
//! - Follow health and lifecycle events for each backend's monitor service

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;

use crate::config::{BackendConfig, LoadBalancingStrategy};
use crate::events::ControlEvent;
use crate::health::HealthStatus;
use crate::lifecycle::ShutdownSignal;
use crate::load_balancer::{
    backend::{Backend, BackendStats},
    Balancer, LoadBalancer,
};
use crate::registry::{ServiceRegistry, ServiceState};

#[derive(Debug)]
struct ServicePool {
    backends: Vec<Arc<Backend>>,
    balancer: ArcSwap<Balancer>,
}

/// Backends of every logical service plus the active strategy.
#[derive(Debug)]
pub struct BackendPools {
    pools: BTreeMap<String, ServicePool>,
    strategy: ArcSwap<LoadBalancingStrategy>,
}

impl BackendPools {
    pub fn new(backends: Vec<Backend>, strategy: LoadBalancingStrategy) -> Self {
        let mut grouped: BTreeMap<String, Vec<Arc<Backend>>> = BTreeMap::new();
        for backend in backends {
            grouped.entry(backend.service.clone()).or_default().push(Arc::new(backend));
        }

        let pools = grouped
            .into_iter()
            .map(|(service, backends)| {
                let pool = ServicePool {
                    backends,
                    balancer: ArcSwap::from_pointee(Balancer::new(strategy)),
                };
                (service, pool)
            })
            .collect();

        Self {
            pools,
            strategy: ArcSwap::from_pointee(strategy),
        }
    }

    /// Build pools from configuration, skipping backends with unparsable addresses.
    pub fn from_config(configs: &[BackendConfig], strategy: LoadBalancingStrategy) -> Self {
        let backends = configs
            .iter()
            .filter_map(|config| match Backend::from_config(config) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    tracing::warn!(backend = %config.id, address = %config.address, error = %e, "Invalid backend address");
                    None
                }
            })
            .collect();
        Self::new(backends, strategy)
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        **self.strategy.load()
    }

    /// Swap the strategy for every service. In-flight selections finish on the old one.
    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        let previous = self.strategy();
        if previous == strategy {
            return;
        }
        for pool in self.pools.values() {
            pool.balancer.store(Arc::new(Balancer::new(strategy)));
        }
        self.strategy.store(Arc::new(strategy));
        tracing::info!(from = %previous, to = %strategy, "Load balancing strategy changed");
    }

    pub fn contains(&self, service: &str) -> bool {
        self.pools.contains_key(service)
    }

    pub fn services(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    pub fn backends(&self, service: &str) -> &[Arc<Backend>] {
        self.pools.get(service).map(|p| p.backends.as_slice()).unwrap_or(&[])
    }

    /// Eligible backends: not unhealthy, below max_connections, accepted by `filter`.
    pub fn candidates(&self, service: &str, filter: impl Fn(&Backend) -> bool) -> Vec<Arc<Backend>> {
        self.backends(service)
            .iter()
            .filter(|b| b.is_healthy() && b.has_capacity() && filter(b))
            .cloned()
            .collect()
    }

    /// Pick one eligible backend of `service` with the current strategy.
    pub fn select(&self, service: &str, filter: impl Fn(&Backend) -> bool) -> Option<Arc<Backend>> {
        let pool = self.pools.get(service)?;
        let candidates = self.candidates(service, filter);
        if candidates.is_empty() {
            tracing::debug!(service = %service, backend_count = pool.backends.len(), "No eligible backends");
            return None;
        }
        pool.balancer.load().next_server(&candidates)
    }

    /// Set the health of every backend gated by `monitor`.
    pub fn set_health(&self, monitor: &str, status: HealthStatus) {
        for backend in self.pools.values().flat_map(|p| p.backends.iter()) {
            if backend.monitor == monitor && backend.health() != status {
                tracing::debug!(backend = %backend.id, %status, "Backend health updated");
                backend.set_health(status);
            }
        }
    }

    /// Fold one control event into backend health.
    ///
    /// Probe results for a quarantined service are ignored; its backends
    /// follow the registry until the quarantine is lifted.
    pub fn apply_event(&self, registry: &ServiceRegistry, event: &ControlEvent) {
        match event {
            ControlEvent::HealthChanged { service, status } => {
                if registry.get(service).is_some_and(|d| d.quarantined) {
                    tracing::debug!(service = %service, %status, "Ignoring health change of quarantined service");
                    return;
                }
                self.set_health(service, *status);
            }
            ControlEvent::StateChanged { service, to, .. } => {
                if let Some(status) = availability(*to) {
                    self.set_health(service, status);
                }
            }
            _ => {}
        }
    }

    /// Rebuild backend health from the registry's current view of every monitor.
    pub fn resync(&self, registry: &ServiceRegistry) {
        let monitors: BTreeSet<&str> = self
            .pools
            .values()
            .flat_map(|p| p.backends.iter())
            .map(|b| b.monitor.as_str())
            .collect();

        for monitor in monitors {
            let Some(descriptor) = registry.get(monitor) else {
                continue;
            };
            let status = if descriptor.quarantined {
                Some(HealthStatus::Unhealthy)
            } else {
                availability(descriptor.state)
            };
            if let Some(status) = status {
                self.set_health(monitor, status);
            }
        }
    }

    /// Keep backend health in step with the registry's events until shutdown.
    pub async fn run_health_listener(self: Arc<Self>, registry: Arc<ServiceRegistry>, mut shutdown: ShutdownSignal) {
        let mut rx = registry.events().subscribe();
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                received = rx.recv() => match received {
                    Ok(event) => self.apply_event(&registry, &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Pool health listener lagged behind event bus, resyncing");
                        self.resync(&registry);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Pool health listener stopped");
    }

    pub fn stats(&self) -> Vec<BackendStats> {
        self.pools
            .values()
            .flat_map(|p| p.backends.iter())
            .map(|b| b.stats())
            .collect()
    }
}

fn availability(state: ServiceState) -> Option<HealthStatus> {
    match state {
        ServiceState::Healthy => Some(HealthStatus::Healthy),
        ServiceState::Degraded => Some(HealthStatus::Degraded),
        ServiceState::Unhealthy | ServiceState::Stopping | ServiceState::Stopped => Some(HealthStatus::Unhealthy),
        ServiceState::Unknown | ServiceState::Starting => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::{ServiceKind, ServiceSpec};
    use std::time::Duration;
    use url::Url;

    fn registry(bus: EventBus) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new(bus));
        registry
            .register_all(vec![
                ServiceSpec::new("ai-node-1", ServiceKind::AiService),
                ServiceSpec::new("ai-node-2", ServiceKind::AiService),
            ])
            .unwrap();
        registry
    }

    fn pools(strategy: LoadBalancingStrategy) -> BackendPools {
        let backend = |id: &str, port: u16, monitor: &str| {
            Backend::new(id, "ai", Url::parse(&format!("http://127.0.0.1:{port}")).unwrap()).with_monitor(monitor)
        };
        BackendPools::new(
            vec![backend("ai-1", 9001, "ai-node-1"), backend("ai-2", 9002, "ai-node-2")],
            strategy,
        )
    }

    #[test]
    fn test_select_skips_unhealthy_and_filtered() {
        let pools = pools(LoadBalancingStrategy::RoundRobin);
        pools.set_health("ai-node-1", HealthStatus::Unhealthy);

        for _ in 0..4 {
            assert_eq!(pools.select("ai", |_| true).unwrap().id, "ai-2");
        }
        assert!(pools.select("ai", |b| b.id != "ai-2").is_none());
        assert!(pools.select("unknown", |_| true).is_none());
    }

    #[test]
    fn test_strategy_swap() {
        let pools = pools(LoadBalancingStrategy::RoundRobin);
        pools.set_strategy(LoadBalancingStrategy::LeastConnections);
        assert_eq!(pools.strategy(), LoadBalancingStrategy::LeastConnections);

        let busy = pools.backends("ai")[0].clone();
        let _guard = busy.try_create_guard().unwrap();
        for _ in 0..3 {
            assert_eq!(pools.select("ai", |_| true).unwrap().id, "ai-2");
        }
    }

    #[test]
    fn test_lifecycle_events_gate_backends() {
        let pools = pools(LoadBalancingStrategy::RoundRobin);
        let registry = registry(EventBus::new());
        pools.apply_event(&registry, &ControlEvent::StateChanged {
            service: "ai-node-2".into(),
            from: ServiceState::Healthy,
            to: ServiceState::Stopped,
        });
        assert!(!pools.backends("ai")[1].is_healthy());

        pools.apply_event(&registry, &ControlEvent::StateChanged {
            service: "ai-node-2".into(),
            from: ServiceState::Starting,
            to: ServiceState::Healthy,
        });
        assert_eq!(pools.backends("ai")[1].health(), HealthStatus::Healthy);
    }

    #[test]
    fn test_health_changes_ignored_while_quarantined() {
        let pools = pools(LoadBalancingStrategy::RoundRobin);
        let registry = registry(EventBus::new());
        registry.quarantine("ai-node-1").unwrap();
        pools.resync(&registry);
        assert!(!pools.backends("ai")[0].is_healthy());

        pools.apply_event(&registry, &ControlEvent::HealthChanged {
            service: "ai-node-1".into(),
            status: HealthStatus::Healthy,
        });
        assert_eq!(registry.state("ai-node-1"), Some(ServiceState::Unhealthy));
        assert!(!pools.backends("ai")[0].is_healthy());

        registry.release("ai-node-1").unwrap();
        pools.apply_event(&registry, &ControlEvent::HealthChanged {
            service: "ai-node-1".into(),
            status: HealthStatus::Healthy,
        });
        assert!(pools.backends("ai")[0].is_healthy());
    }

    #[tokio::test]
    async fn test_lagged_listener_resyncs_from_registry() {
        let bus = EventBus::with_capacity(4);
        let registry = registry(bus.clone());
        let pools = Arc::new(pools(LoadBalancingStrategy::RoundRobin));
        let shutdown = crate::lifecycle::Shutdown::new();

        let listener = tokio::spawn(pools.clone().run_health_listener(registry.clone(), shutdown.subscribe()));
        // Let the listener subscribe before flooding the bus.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The stop is the first event; the filler pushes it out of the buffer.
        registry.transition("ai-node-2", ServiceState::Stopped).unwrap();
        for _ in 0..16 {
            bus.publish(ControlEvent::ServiceRegistered { service: "other".into() });
        }

        let mut resynced = false;
        for _ in 0..100 {
            if !pools.backends("ai")[1].is_healthy() {
                resynced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(resynced, "missed stop was not recovered from the registry");
        assert!(pools.backends("ai")[0].is_healthy());

        shutdown.trigger();
        listener.await.unwrap();
    }
}
