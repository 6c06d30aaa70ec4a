//! Service registry subsystem.
//!
//! # Data Flow
//! ```text
//! config [[services]] / API
//!     → register_all (validate batch, resolve levels, commit)
//!     → DashMap<name, ServiceDescriptor>
//!     → cached Levels (recomputed on every topology mutation)
//!
//! State transitions:
//!     Orchestrator → transition()
//!     HealthMonitor → apply_health()
//!     RecoveryManager → quarantine()
//!     → StateChanged event
//! ```
//!
//! # Design Decisions
//! - Topology mutations are serialized and applied all-or-nothing
//! - State updates lock one entry at a time; no global lock on the read path
//! - Callers receive clones, never references into the map

pub mod descriptor;
pub mod resolver;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use thiserror::Error;

use crate::events::{ControlEvent, EventBus};
use crate::health::HealthStatus;

pub use descriptor::{ServiceDescriptor, ServiceKind, ServiceSpec, ServiceState};
pub use resolver::{resolve_levels, DependencyCycleError, Levels};

/// Errors from registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Cycle(#[from] DependencyCycleError),

    #[error("service '{0}' is already registered")]
    Duplicate(String),

    #[error("service '{0}' depends on itself")]
    SelfDependency(String),

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("service '{0}' is not registered")]
    NotFound(String),

    #[error("service '{service}' is still required by: {}", .dependents.join(", "))]
    HasDependents { service: String, dependents: Vec<String> },

    #[error("dependency '{dependency}' of service '{service}' is {state}")]
    DependencyUnhealthy {
        service: String,
        dependency: String,
        state: ServiceState,
    },
}

/// The single owner of service descriptors and their state.
pub struct ServiceRegistry {
    services: DashMap<String, ServiceDescriptor>,
    topology: Mutex<()>,
    levels: ArcSwapOption<Levels>,
    events: EventBus,
}

impl ServiceRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            services: DashMap::new(),
            topology: Mutex::new(()),
            levels: ArcSwapOption::empty(),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a single service.
    pub fn register(&self, spec: ServiceSpec) -> Result<(), RegistryError> {
        self.register_all(vec![spec])
    }

    /// Register a batch of services atomically.
    ///
    /// Either every spec is accepted or the registry is left untouched.
    pub fn register_all(&self, specs: Vec<ServiceSpec>) -> Result<(), RegistryError> {
        let _guard = self.topology.lock().expect("registry topology mutex poisoned");

        let mut graph = self.graph();
        for spec in &specs {
            if spec.dependencies.contains(&spec.name) {
                return Err(RegistryError::SelfDependency(spec.name.clone()));
            }
            if graph.insert(spec.name.clone(), spec.dependencies.clone()).is_some() {
                return Err(RegistryError::Duplicate(spec.name.clone()));
            }
        }
        for spec in &specs {
            if let Some(missing) = spec.dependencies.iter().find(|d| !graph.contains_key(*d)) {
                return Err(RegistryError::UnknownDependency {
                    service: spec.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        let levels = resolve_levels(&graph)?;

        let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        for spec in specs {
            let deps = spec.dependencies.clone();
            let name = spec.name.clone();
            self.services.insert(name.clone(), ServiceDescriptor::from_spec(spec));
            for dep in deps {
                if let Some(mut entry) = self.services.get_mut(&dep) {
                    entry.dependents.insert(name.clone());
                }
            }
        }
        // Dependents of services registered later in the same batch.
        for name in &names {
            let dependents: BTreeSet<String> = graph
                .iter()
                .filter(|(_, deps)| deps.contains(name))
                .map(|(n, _)| n.clone())
                .collect();
            if let Some(mut entry) = self.services.get_mut(name) {
                entry.dependents = dependents;
            }
        }
        self.levels.store(Some(Arc::new(levels)));

        for name in names {
            tracing::info!(service = %name, "Service registered");
            self.events.publish(ControlEvent::ServiceRegistered { service: name });
        }
        Ok(())
    }

    /// Remove a service that nothing depends on.
    pub fn deregister(&self, name: &str) -> Result<ServiceDescriptor, RegistryError> {
        let _guard = self.topology.lock().expect("registry topology mutex poisoned");

        let dependents = self
            .services
            .get(name)
            .map(|d| d.dependents.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !dependents.is_empty() {
            return Err(RegistryError::HasDependents {
                service: name.to_string(),
                dependents: dependents.into_iter().collect(),
            });
        }

        let (_, removed) = self
            .services
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        for dep in &removed.dependencies {
            if let Some(mut entry) = self.services.get_mut(dep) {
                entry.dependents.remove(name);
            }
        }
        let levels = resolve_levels(&self.graph())?;
        self.levels.store(Some(Arc::new(levels)));

        tracing::info!(service = %name, "Service deregistered");
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<ServiceDescriptor> {
        self.services.get(name).map(|d| d.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).map(|d| d.state)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// All descriptors, sorted by name.
    pub fn list(&self) -> Vec<ServiceDescriptor> {
        let mut all: Vec<_> = self.services.iter().map(|d| d.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.iter().map(|d| d.key().clone()).collect();
        names.sort();
        names
    }

    /// Cached startup levels for the whole registry.
    pub fn levels(&self) -> Result<Arc<Levels>, RegistryError> {
        if let Some(levels) = self.levels.load_full() {
            return Ok(levels);
        }
        let _guard = self.topology.lock().expect("registry topology mutex poisoned");
        let levels = Arc::new(resolve_levels(&self.graph())?);
        self.levels.store(Some(levels.clone()));
        Ok(levels)
    }

    /// `targets` plus everything they transitively depend on. Empty targets means all.
    pub fn dependency_closure(&self, targets: &[String]) -> Result<BTreeSet<String>, RegistryError> {
        self.closure(targets, |d| d.dependencies.clone())
    }

    /// `targets` plus everything that transitively depends on them. Empty targets means all.
    pub fn dependents_closure(&self, targets: &[String]) -> Result<BTreeSet<String>, RegistryError> {
        self.closure(targets, |d| d.dependents.clone())
    }

    fn closure<F>(&self, targets: &[String], edges: F) -> Result<BTreeSet<String>, RegistryError>
    where
        F: Fn(&ServiceDescriptor) -> BTreeSet<String>,
    {
        if targets.is_empty() {
            return Ok(self.names().into_iter().collect());
        }
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = targets.to_vec();
        while let Some(name) = stack.pop() {
            if seen.contains(&name) {
                continue;
            }
            let next = self
                .services
                .get(&name)
                .map(|d| edges(d.value()))
                .ok_or_else(|| RegistryError::NotFound(name.clone()))?;
            seen.insert(name);
            stack.extend(next.into_iter().filter(|n| !seen.contains(n)));
        }
        Ok(seen)
    }

    /// First dependency of `name` that does not currently satisfy its dependents.
    pub fn unsatisfied_dependency(&self, name: &str) -> Result<Option<(String, ServiceState)>, RegistryError> {
        let deps = self
            .services
            .get(name)
            .map(|d| d.dependencies.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        for dep in deps {
            match self.services.get(&dep) {
                Some(d) if d.satisfies_dependents() => {}
                Some(d) => return Ok(Some((dep.clone(), d.state))),
                None => return Ok(Some((dep, ServiceState::Unknown))),
            }
        }
        Ok(None)
    }

    /// Request a state transition. Returns the previous state.
    ///
    /// A service cannot become `Healthy` while a dependency is unsatisfied.
    pub fn transition(&self, name: &str, to: ServiceState) -> Result<ServiceState, RegistryError> {
        if to == ServiceState::Healthy {
            if let Some((dependency, state)) = self.unsatisfied_dependency(name)? {
                return Err(RegistryError::DependencyUnhealthy {
                    service: name.to_string(),
                    dependency,
                    state,
                });
            }
        }
        let from = {
            let mut entry = self
                .services
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            let from = entry.state;
            entry.state = to;
            from
        };
        self.announce(name, from, to);
        Ok(from)
    }

    /// Apply a health observation.
    ///
    /// Returns `Some((from, to))` when the state changed. Observations are
    /// ignored for stopped/stopping/quarantined services, failures leave a
    /// `Starting` service starting, and a healthy probe with unsatisfied
    /// dependencies yields `Degraded`.
    pub fn apply_health(&self, name: &str, status: HealthStatus) -> Option<(ServiceState, ServiceState)> {
        let deps_ok = match status {
            HealthStatus::Healthy => self.unsatisfied_dependency(name).ok()?.is_none(),
            _ => true,
        };
        let (from, to) = {
            let mut entry = self.services.get_mut(name)?;
            if entry.quarantined || !entry.state.is_monitored() {
                return None;
            }
            let from = entry.state;
            let to = match status {
                HealthStatus::Healthy if deps_ok => ServiceState::Healthy,
                HealthStatus::Healthy | HealthStatus::Degraded => ServiceState::Degraded,
                HealthStatus::Unhealthy if from == ServiceState::Starting => ServiceState::Starting,
                HealthStatus::Unhealthy => ServiceState::Unhealthy,
                HealthStatus::Unknown => return None,
            };
            if from == to {
                return None;
            }
            entry.state = to;
            (from, to)
        };
        self.announce(name, from, to);
        Some((from, to))
    }

    /// Mark a service unhealthy until manual intervention.
    pub fn quarantine(&self, name: &str) -> Result<(), RegistryError> {
        let from = {
            let mut entry = self
                .services
                .get_mut(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            entry.quarantined = true;
            let from = entry.state;
            entry.state = ServiceState::Unhealthy;
            from
        };
        tracing::warn!(service = %name, "Service quarantined");
        self.announce(name, from, ServiceState::Unhealthy);
        Ok(())
    }

    /// Clear the quarantine flag. Returns whether it was set.
    pub fn release(&self, name: &str) -> Result<bool, RegistryError> {
        let mut entry = self
            .services
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let was = entry.quarantined;
        entry.quarantined = false;
        Ok(was)
    }

    fn announce(&self, name: &str, from: ServiceState, to: ServiceState) {
        if from == to {
            return;
        }
        tracing::info!(service = %name, from = %from, to = %to, "Service state changed");
        self.events.publish(ControlEvent::StateChanged {
            service: name.to_string(),
            from,
            to,
        });
    }

    fn graph(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.services
            .iter()
            .map(|d| (d.key().clone(), d.dependencies.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(EventBus::new())
    }

    fn stack() -> Vec<ServiceSpec> {
        vec![
            ServiceSpec::new("db", ServiceKind::Database),
            ServiceSpec::new("cache", ServiceKind::Cache),
            ServiceSpec::new("api", ServiceKind::Gateway).depends_on(["db", "cache"]),
        ]
    }

    #[test]
    fn test_register_derives_dependents() {
        let reg = registry();
        reg.register_all(stack()).unwrap();

        let db = reg.get("db").unwrap();
        assert!(db.dependents.contains("api"));
        assert_eq!(db.state, ServiceState::Unknown);
        assert_eq!(reg.levels().unwrap().len(), 2);
    }

    #[test]
    fn test_cycle_rejected_without_partial_apply() {
        let reg = registry();
        reg.register(ServiceSpec::new("db", ServiceKind::Database)).unwrap();

        let err = reg
            .register_all(vec![
                ServiceSpec::new("a", ServiceKind::Processing).depends_on(["db", "b"]),
                ServiceSpec::new("b", ServiceKind::Processing).depends_on(["a"]),
            ])
            .unwrap_err();

        match err {
            RegistryError::Cycle(cycle) => assert_eq!(cycle.services, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
        assert_eq!(reg.names(), vec!["db"]);
        assert!(reg.get("db").unwrap().dependents.is_empty());
    }

    #[test]
    fn test_self_and_unknown_dependencies_rejected() {
        let reg = registry();
        let err = reg
            .register(ServiceSpec::new("loop", ServiceKind::Processing).depends_on(["loop"]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::SelfDependency(_)));

        let err = reg
            .register(ServiceSpec::new("api", ServiceKind::Gateway).depends_on(["ghost"]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDependency { .. }));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_healthy_requires_satisfied_dependencies() {
        let reg = registry();
        reg.register_all(stack()).unwrap();

        let err = reg.transition("api", ServiceState::Healthy).unwrap_err();
        assert!(matches!(err, RegistryError::DependencyUnhealthy { .. }));

        reg.transition("db", ServiceState::Healthy).unwrap();
        reg.transition("cache", ServiceState::Degraded).unwrap();
        reg.transition("api", ServiceState::Healthy).unwrap();
        assert_eq!(reg.state("api"), Some(ServiceState::Healthy));
    }

    #[test]
    fn test_healthy_probe_with_failed_dependency_yields_degraded() {
        let reg = registry();
        reg.register_all(stack()).unwrap();
        reg.transition("api", ServiceState::Starting).unwrap();

        let change = reg.apply_health("api", HealthStatus::Healthy);
        assert_eq!(change, Some((ServiceState::Starting, ServiceState::Degraded)));
    }

    #[test]
    fn test_health_ignored_for_stopped_and_quarantined() {
        let reg = registry();
        reg.register_all(stack()).unwrap();
        reg.transition("db", ServiceState::Stopped).unwrap();
        assert_eq!(reg.apply_health("db", HealthStatus::Healthy), None);

        reg.transition("cache", ServiceState::Healthy).unwrap();
        reg.quarantine("cache").unwrap();
        assert_eq!(reg.apply_health("cache", HealthStatus::Healthy), None);
        assert_eq!(reg.state("cache"), Some(ServiceState::Unhealthy));

        assert!(reg.release("cache").unwrap());
        assert!(reg.apply_health("cache", HealthStatus::Healthy).is_some());
    }

    #[test]
    fn test_failures_keep_starting_service_starting() {
        let reg = registry();
        reg.register(ServiceSpec::new("db", ServiceKind::Database)).unwrap();
        reg.transition("db", ServiceState::Starting).unwrap();
        assert_eq!(reg.apply_health("db", HealthStatus::Unhealthy), None);
        assert_eq!(reg.state("db"), Some(ServiceState::Starting));
    }

    #[test]
    fn test_closures() {
        let reg = registry();
        reg.register_all(stack()).unwrap();
        reg.register(ServiceSpec::new("edge", ServiceKind::Gateway).depends_on(["api"]))
            .unwrap();

        let deps = reg.dependency_closure(&["api".to_string()]).unwrap();
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["api", "cache", "db"]);

        let dependents = reg.dependents_closure(&["db".to_string()]).unwrap();
        assert_eq!(dependents.into_iter().collect::<Vec<_>>(), vec!["api", "db", "edge"]);

        assert!(matches!(
            reg.dependency_closure(&["nope".to_string()]),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_deregister_requires_no_dependents() {
        let reg = registry();
        reg.register_all(stack()).unwrap();
        assert!(matches!(reg.deregister("db"), Err(RegistryError::HasDependents { .. })));

        reg.deregister("api").unwrap();
        reg.deregister("db").unwrap();
        assert_eq!(reg.names(), vec!["cache"]);
        assert_eq!(reg.levels().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_publish_events() {
        let bus = EventBus::new();
        let reg = ServiceRegistry::new(bus.clone());
        let mut rx = bus.subscribe();
        reg.register(ServiceSpec::new("db", ServiceKind::Database)).unwrap();
        reg.transition("db", ServiceState::Starting).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ControlEvent::ServiceRegistered { service: "db".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ControlEvent::StateChanged {
                service: "db".into(),
                from: ServiceState::Unknown,
                to: ServiceState::Starting,
            }
        );
    }
}
