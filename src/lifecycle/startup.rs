//! Control plane assembly.
//!
//! # Responsibilities
//! - Validate configuration and build every subsystem from it
//! - Spawn background tasks (probes, recovery, pool health, cache sweep, config reload)
//! - Stop them again on shutdown
//!
//! # Design Decisions
//! - Fail fast: any construction error is fatal
//! - Subsystems are built in dependency order, not concurrently
//! - The API listener is bound by the caller once this returns

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::RecommendedWatcher;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheError, CacheManager};
use crate::config::{validate_config, ConfigError, ConfigWatcher, ControlPlaneConfig, ServiceConfig};
use crate::events::EventBus;
use crate::health::{HealthMonitor, HealthProbe, HttpProbe, MonitorSettings};
use crate::lifecycle::hooks::HookRegistry;
use crate::lifecycle::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::lifecycle::recovery::{RecoveryManager, RecoverySettings};
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::load_balancer::BackendPools;
use crate::registry::{RegistryError, ServiceRegistry};
use crate::resilience::{BreakerSettings, CircuitBreakers};
use crate::routing::{RequestRouter, RouterSettings};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("config watcher: {0}")]
    Watcher(#[from] notify::Error),
}

/// Every long-lived component, wired together.
pub struct ControlPlane {
    config: ArcSwap<ControlPlaneConfig>,
    pub events: EventBus,
    pub registry: Arc<ServiceRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub hooks: Arc<HookRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub recovery: Arc<RecoveryManager>,
    pub router: Arc<RequestRouter>,
    shutdown: Shutdown,
}

/// Handles of spawned background tasks.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl ControlPlane {
    /// Build with HTTP health probes.
    pub fn new(config: ControlPlaneConfig) -> Result<Self, StartupError> {
        Self::with_probe(config, Arc::new(HttpProbe::new()))
    }

    pub fn with_probe(config: ControlPlaneConfig, probe: Arc<dyn HealthProbe>) -> Result<Self, StartupError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let events = EventBus::new();
        let registry = Arc::new(ServiceRegistry::new(events.clone()));
        registry.register_all(config.services.iter().map(ServiceConfig::to_spec).collect())?;
        tracing::info!(
            services = registry.len(),
            levels = registry.levels()?.len(),
            "Services registered"
        );

        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            probe,
            MonitorSettings::from(&config.health),
        ));
        let hooks = Arc::new(HookRegistry::from_config(&config.services));
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            monitor.clone(),
            hooks.clone(),
            OrchestratorSettings::from(&config.orchestrator),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            orchestrator.clone(),
            registry.clone(),
            RecoverySettings::from(&config.recovery),
        ));

        let pools = Arc::new(BackendPools::from_config(&config.router.backends, config.router.strategy));
        let breakers = Arc::new(CircuitBreakers::new(BreakerSettings::from(&config.circuit_breaker)));
        let cache = Arc::new(CacheManager::in_memory(&config.cache)?);
        let router = Arc::new(RequestRouter::new(
            pools,
            breakers,
            cache,
            RouterSettings::from(&config),
        ));
        tracing::info!(
            strategy = %config.router.strategy,
            backends = config.router.backends.len(),
            cache_enabled = config.cache.enabled,
            "Router initialized"
        );

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            events,
            registry,
            monitor,
            hooks,
            orchestrator,
            recovery,
            router,
            shutdown: Shutdown::new(),
        })
    }

    pub fn config(&self) -> Arc<ControlPlaneConfig> {
        self.config.load_full()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    /// Spawn background tasks. With `config_path`, the file is watched for hot reload.
    pub fn spawn_background(self: &Arc<Self>, config_path: Option<&Path>) -> Result<BackgroundTasks, StartupError> {
        let config = self.config();
        let mut handles = vec![
            tokio::spawn(self.monitor.clone().run(self.shutdown.subscribe())),
            tokio::spawn(self.recovery.clone().run(self.shutdown.subscribe())),
            tokio::spawn(
                self.router
                    .pools()
                    .clone()
                    .run_health_listener(self.registry.clone(), self.shutdown.subscribe()),
            ),
        ];
        if config.cache.enabled {
            handles.push(tokio::spawn(self.router.cache().clone().run_sweeper(
                Duration::from_secs(config.cache.sweep_interval_secs),
                self.shutdown.subscribe(),
            )));
        }

        let watcher = match config_path {
            Some(path) => {
                let (watcher, updates) = ConfigWatcher::new(path);
                let watcher = watcher.run()?;
                handles.push(tokio::spawn(self.clone().run_reloader(
                    path.to_path_buf(),
                    updates,
                    self.shutdown.subscribe(),
                )));
                Some(watcher)
            }
            None => None,
        };

        tracing::info!(tasks = handles.len(), "Background tasks started");
        Ok(BackgroundTasks {
            handles,
            _watcher: watcher,
        })
    }

    async fn run_reloader(
        self: Arc<Self>,
        path: PathBuf,
        mut updates: mpsc::UnboundedReceiver<ControlPlaneConfig>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(config) => self.apply_reload(config),
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        tracing::debug!(path = ?path, "Config reloader stopped");
    }

    /// Swap in the hot-reloadable parts of `new`: strategy and cache policies.
    pub fn apply_reload(&self, new: ControlPlaneConfig) {
        let current = self.config();

        if new.router.strategy != current.router.strategy {
            self.router.set_strategy(new.router.strategy);
        }
        if let Err(e) = self.router.cache().reload(&new.cache) {
            tracing::error!(error = %e, "Cache policy reload rejected, keeping current policies");
            return;
        }

        let restart_needed = [
            ("services", section_changed(&current.services, &new.services)),
            ("api", section_changed(&current.api, &new.api)),
            ("health", section_changed(&current.health, &new.health)),
            ("router.backends", section_changed(&current.router.backends, &new.router.backends)),
            ("circuit_breaker", section_changed(&current.circuit_breaker, &new.circuit_breaker)),
            ("recovery", section_changed(&current.recovery, &new.recovery)),
        ];
        for (section, _) in restart_needed.iter().filter(|(_, changed)| *changed) {
            tracing::warn!(section, "Config section changed; takes effect after restart");
        }

        tracing::info!(strategy = %new.router.strategy, "Configuration reloaded");
        self.config.store(Arc::new(new));
    }

    /// Signal background tasks and wait for them to exit.
    pub async fn stop(&self, tasks: BackgroundTasks) {
        self.shutdown.trigger();
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Background task panicked");
                }
            }
        }
        tracing::info!("Background tasks stopped");
    }
}

fn section_changed<T: serde::Serialize>(a: &T, b: &T) -> bool {
    serde_json::to_value(a).ok() != serde_json::to_value(b).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, LoadBalancingStrategy};

    const CONFIG: &str = r#"
        [[services]]
        name = "db"
        kind = "database"

        [[services]]
        name = "search"
        kind = "ai_service"
        dependencies = ["db"]

        [router]
        strategy = "round_robin"

        [[router.backends]]
        id = "search-1"
        service = "search"
        address = "http://127.0.0.1:9101"
        monitor = "search"

        [[cache.policies]]
        pattern = "get_*"
        ttl_secs = 60
    "#;

    #[test]
    fn test_builds_from_config() {
        let plane = ControlPlane::new(parse_config(CONFIG).unwrap()).unwrap();
        assert_eq!(plane.registry.len(), 2);
        assert!(plane.router.pools().contains("search"));
        assert!(plane.router.cache().policy_for("get_user").is_some());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = parse_config(CONFIG).unwrap();
        config.services[0].dependencies = vec!["search".into()];
        assert!(matches!(
            ControlPlane::new(config),
            Err(StartupError::Config(ConfigError::Validation(_)))
        ));
    }

    #[test]
    fn test_reload_swaps_strategy_and_policies() {
        let plane = ControlPlane::new(parse_config(CONFIG).unwrap()).unwrap();

        let mut next = parse_config(CONFIG).unwrap();
        next.router.strategy = LoadBalancingStrategy::LeastConnections;
        next.cache.policies[0].pattern = "list_*".into();
        plane.apply_reload(next);

        assert_eq!(plane.router.pools().strategy(), LoadBalancingStrategy::LeastConnections);
        assert!(plane.router.cache().policy_for("get_user").is_none());
        assert!(plane.router.cache().policy_for("list_users").is_some());
        assert_eq!(plane.config().router.strategy, LoadBalancingStrategy::LeastConnections);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let plane = Arc::new(ControlPlane::new(parse_config(CONFIG).unwrap()).unwrap());
        let tasks = plane.spawn_background(None).unwrap();
        assert_eq!(tasks.len(), 4);
        tokio::time::timeout(Duration::from_secs(5), plane.stop(tasks))
            .await
            .expect("background tasks should exit");
    }
}
