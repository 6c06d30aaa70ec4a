//! Ordered startup, shutdown and restart of managed services.
//!
//! # Data Flow
//! ```text
//! startup(targets)
//!     → dependency closure → levels restricted to it
//!     → per level: start hooks concurrently (Starting)
//!     → await convergence: health checks + StateChanged events, shared deadline
//!     → next level only once every member converged
//!
//! shutdown(targets, graceful)
//!     → dependents closure → reversed levels
//!     → per level: graceful stop bounded by drain timeout, then force
//! ```
//!
//! # Design Decisions
//! - One operation at a time; a second caller waits for the first
//! - Timed-out services are marked Unhealthy and the operation aborts; started services keep running
//! - Every operation yields a report; the last one is kept for the status endpoint

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::health::HealthMonitor;
use crate::lifecycle::hooks::{HookRegistry, StopMode};
use crate::registry::{Levels, RegistryError, ServiceRegistry, ServiceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Startup,
    Shutdown,
    Restart,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Restart => "restart",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Started,
    AlreadyRunning,
    Stopped,
    ForceStopped,
    AlreadyStopped,
    Failed,
    TimedOut,
    /// Not attempted because an earlier level failed.
    Skipped,
}

impl Outcome {
    fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceOutcome {
    pub service: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub state: ServiceState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub id: Uuid,
    pub operation: OperationKind,
    pub targets: Vec<String>,
    pub levels: Vec<Vec<String>>,
    /// Milliseconds since the Unix epoch.
    pub started_at: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub services: Vec<ServiceOutcome>,
}

impl OperationReport {
    pub fn outcome(&self, service: &str) -> Option<&ServiceOutcome> {
        self.services.iter().find(|s| s.service == service)
    }

    /// Services that failed or timed out.
    pub fn failed(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| s.outcome.is_failure())
            .map(|s| s.service.clone())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{operation} failed for: {}", .failed.join(", "))]
    OperationFailed {
        operation: OperationKind,
        failed: Vec<String>,
        report: Box<OperationReport>,
    },
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Budget for one whole startup or one restart convergence.
    pub startup_timeout: Duration,
    pub drain_timeout: Duration,
    /// How often pending services are actively health-checked while converging.
    pub poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for OrchestratorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            poll_interval: Duration::from_secs(1),
        }
    }
}

enum Launch {
    AlreadyRunning,
    Started,
    Failed(String),
    /// The start hook did not return before the operation deadline.
    TimedOut,
}

struct ReportBuilder {
    id: Uuid,
    operation: OperationKind,
    targets: Vec<String>,
    levels: Vec<Vec<String>>,
    started_at: SystemTime,
    started: Instant,
    services: Vec<ServiceOutcome>,
}

impl ReportBuilder {
    fn new(operation: OperationKind, targets: &[String], levels: &Levels) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            targets: targets.to_vec(),
            levels: levels.iter().cloned().collect(),
            started_at: SystemTime::now(),
            started: Instant::now(),
            services: Vec::new(),
        }
    }

    fn push(&mut self, registry: &ServiceRegistry, service: &str, outcome: Outcome, elapsed: Duration, error: Option<String>) {
        self.services.push(ServiceOutcome {
            service: service.to_string(),
            outcome,
            duration_ms: elapsed.as_millis() as u64,
            state: registry.state(service).unwrap_or_default(),
            error,
        });
    }

    fn has_failures(&self) -> bool {
        self.services.iter().any(|s| s.outcome.is_failure())
    }

    fn finish(self) -> OperationReport {
        let success = !self.has_failures();
        OperationReport {
            id: self.id,
            operation: self.operation,
            targets: self.targets,
            levels: self.levels,
            started_at: self.started_at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64,
            duration_ms: self.started.elapsed().as_millis() as u64,
            success,
            services: self.services,
        }
    }
}

pub struct Orchestrator {
    registry: Arc<ServiceRegistry>,
    monitor: Arc<HealthMonitor>,
    hooks: Arc<HookRegistry>,
    settings: OrchestratorSettings,
    op_lock: Mutex<()>,
    last_report: ArcSwapOption<OperationReport>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        monitor: Arc<HealthMonitor>,
        hooks: Arc<HookRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            monitor,
            hooks,
            settings,
            op_lock: Mutex::new(()),
            last_report: ArcSwapOption::empty(),
        }
    }

    pub fn last_report(&self) -> Option<Arc<OperationReport>> {
        self.last_report.load_full()
    }

    /// Start `targets` (empty = all) and everything they depend on, level by level.
    pub async fn startup(&self, targets: &[String]) -> Result<OperationReport, OrchestratorError> {
        let _op = self.op_lock.lock().await;
        let closure = self.registry.dependency_closure(targets)?;
        let levels = self.registry.levels()?.restrict(&closure);
        let deadline = Instant::now() + self.settings.startup_timeout;
        let mut report = ReportBuilder::new(OperationKind::Startup, targets, &levels);

        tracing::info!(targets = ?targets, levels = levels.len(), "Startup beginning");

        let all_levels: Vec<Vec<String>> = levels.iter().cloned().collect();
        for (index, level) in all_levels.iter().enumerate() {
            let results = join_all(level.iter().map(|name| self.bring_up(name, false, deadline))).await;
            for (name, (outcome, elapsed, error)) in level.iter().zip(results) {
                report.push(&self.registry, name, outcome, elapsed, error);
            }

            if report.has_failures() {
                for name in all_levels.iter().skip(index + 1).flatten() {
                    report.push(&self.registry, name, Outcome::Skipped, Duration::ZERO, None);
                }
                return Err(self.fail(report));
            }
            tracing::info!(level = index + 1, services = ?level, "Startup level converged");
        }

        Ok(self.succeed(report))
    }

    /// Stop `targets` (empty = all) and everything depending on them, dependents first.
    pub async fn shutdown(&self, targets: &[String], graceful: bool) -> Result<OperationReport, OrchestratorError> {
        let _op = self.op_lock.lock().await;
        let closure = self.registry.dependents_closure(targets)?;
        let levels = self.registry.levels()?.restrict(&closure).reversed();
        let mut report = ReportBuilder::new(OperationKind::Shutdown, targets, &levels);

        tracing::info!(targets = ?targets, graceful, levels = levels.len(), "Shutdown beginning");

        for level in levels.iter() {
            let results = join_all(level.iter().map(|name| async move {
                let started = Instant::now();
                let (outcome, error) = self.halt(name, graceful).await;
                (outcome, error, started.elapsed())
            }))
            .await;

            for (name, (outcome, error, elapsed)) in level.iter().zip(results) {
                report.push(&self.registry, name, outcome, elapsed, error);
            }
        }

        if report.has_failures() {
            Err(self.fail(report))
        } else {
            Ok(self.succeed(report))
        }
    }

    /// Stop and start one service. Its dependencies must already be satisfied.
    pub async fn restart(&self, service: &str) -> Result<OperationReport, OrchestratorError> {
        let _op = self.op_lock.lock().await;
        if let Some((dependency, state)) = self.registry.unsatisfied_dependency(service)? {
            tracing::warn!(service = %service, dependency = %dependency, %state, "Restart refused");
            return Err(RegistryError::DependencyUnhealthy {
                service: service.to_string(),
                dependency,
                state,
            }
            .into());
        }

        let targets = [service.to_string()];
        let levels = Levels(vec![targets.to_vec()]);
        let mut report = ReportBuilder::new(OperationKind::Restart, &targets, &levels);
        let started = Instant::now();

        tracing::info!(service = %service, "Restart beginning");

        let (outcome, error) = self.halt(service, true).await;
        if outcome.is_failure() {
            report.push(&self.registry, service, outcome, started.elapsed(), error);
            return Err(self.fail(report));
        }

        let deadline = Instant::now() + self.settings.startup_timeout;
        let (outcome, _, error) = self.bring_up(service, true, deadline).await;
        report.push(&self.registry, service, outcome, started.elapsed(), error);
        if outcome.is_failure() {
            Err(self.fail(report))
        } else {
            Ok(self.succeed(report))
        }
    }

    /// Launch one service and wait for it to converge, both bounded by `deadline`.
    async fn bring_up(&self, name: &str, force: bool, deadline: Instant) -> (Outcome, Duration, Option<String>) {
        let started = Instant::now();
        match self.launch(name, force, deadline).await {
            Launch::AlreadyRunning => return (Outcome::AlreadyRunning, Duration::ZERO, None),
            Launch::Failed(e) => return (Outcome::Failed, started.elapsed(), Some(e)),
            Launch::TimedOut => {
                let error = format!("start hook did not return within {:?}", self.settings.startup_timeout);
                return (Outcome::TimedOut, started.elapsed(), Some(error));
            }
            Launch::Started => {}
        }

        let names = [name.to_string()];
        if self.await_convergence(&names, deadline).await.contains_key(name) {
            return (Outcome::Started, started.elapsed(), None);
        }
        let state = self.registry.state(name).unwrap_or_default();
        self.mark(name, ServiceState::Unhealthy);
        let error = format!(
            "did not converge within {:?} (last state {state})",
            self.settings.startup_timeout
        );
        (Outcome::TimedOut, started.elapsed(), Some(error))
    }

    async fn launch(&self, name: &str, force: bool, deadline: Instant) -> Launch {
        let Some(descriptor) = self.registry.get(name) else {
            return Launch::Failed(RegistryError::NotFound(name.to_string()).to_string());
        };
        if !force && descriptor.satisfies_dependents() {
            tracing::debug!(service = %name, state = %descriptor.state, "Already running, skipping start");
            return Launch::AlreadyRunning;
        }

        if matches!(self.registry.release(name), Ok(true)) {
            tracing::info!(service = %name, "Quarantine released by operator action");
        }
        if let Err(e) = self.registry.transition(name, ServiceState::Starting) {
            return Launch::Failed(e.to_string());
        }

        match time::timeout_at(deadline, self.hooks.get(name).start(&descriptor)).await {
            Ok(Ok(())) => Launch::Started,
            Ok(Err(e)) => {
                tracing::error!(service = %name, error = %e, "Start hook failed");
                self.mark(name, ServiceState::Unhealthy);
                Launch::Failed(e.to_string())
            }
            Err(_) => {
                tracing::error!(service = %name, "Start hook did not return before the deadline");
                self.mark(name, ServiceState::Unhealthy);
                Launch::TimedOut
            }
        }
    }

    async fn halt(&self, name: &str, graceful: bool) -> (Outcome, Option<String>) {
        let Some(descriptor) = self.registry.get(name) else {
            return (Outcome::Failed, Some(RegistryError::NotFound(name.to_string()).to_string()));
        };
        if descriptor.state == ServiceState::Stopped {
            return (Outcome::AlreadyStopped, None);
        }
        self.mark(name, ServiceState::Stopping);
        let hooks = self.hooks.get(name);
        let drain = descriptor
            .drain_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.drain_timeout);

        if graceful {
            match time::timeout(drain, hooks.stop(&descriptor, StopMode::Graceful)).await {
                Ok(Ok(())) => {
                    self.mark(name, ServiceState::Stopped);
                    return (Outcome::Stopped, None);
                }
                Ok(Err(e)) => tracing::warn!(service = %name, error = %e, "Graceful stop failed, forcing"),
                Err(_) => tracing::warn!(service = %name, drain = ?drain, "Drain timeout expired, forcing"),
            }
        }

        match time::timeout(drain, hooks.stop(&descriptor, StopMode::Force)).await {
            Ok(Ok(())) => {
                self.mark(name, ServiceState::Stopped);
                (Outcome::ForceStopped, None)
            }
            Ok(Err(e)) => {
                tracing::error!(service = %name, error = %e, "Force stop failed");
                self.mark(name, ServiceState::Unhealthy);
                (Outcome::Failed, Some(e.to_string()))
            }
            Err(_) => {
                tracing::error!(service = %name, timeout = ?drain, "Force stop did not return");
                self.mark(name, ServiceState::Unhealthy);
                (Outcome::TimedOut, Some(format!("force stop did not return within {drain:?}")))
            }
        }
    }

    /// Transition `name`, logging a refused transition instead of failing the operation.
    fn mark(&self, name: &str, state: ServiceState) {
        if let Err(e) = self.registry.transition(name, state) {
            tracing::warn!(service = %name, to = %state, error = %e, "State transition refused");
        }
    }

    /// Wait until each of `names` satisfies its dependents, or `deadline`.
    ///
    /// Returns the time each converged service took.
    async fn await_convergence(&self, names: &[String], deadline: Instant) -> HashMap<String, Duration> {
        let started = Instant::now();
        let mut converged = HashMap::new();
        if names.is_empty() {
            return converged;
        }

        let mut events = self.registry.events().subscribe();
        let mut poll = time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for name in names {
                let ready = self.registry.get(name).is_some_and(|d| d.satisfies_dependents());
                if ready && !converged.contains_key(name) {
                    converged.insert(name.clone(), started.elapsed());
                }
            }
            if converged.len() == names.len() {
                break;
            }

            tokio::select! {
                _ = time::sleep_until(deadline) => break,
                _ = poll.tick() => {
                    let pending = names.iter().filter(|n| !converged.contains_key(*n));
                    let checks = join_all(pending.map(|n| self.monitor.check_now(n)));
                    let _ = time::timeout_at(deadline, checks).await;
                }
                event = events.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = event {
                        break;
                    }
                }
            }
        }
        converged
    }

    fn succeed(&self, report: ReportBuilder) -> OperationReport {
        let report = report.finish();
        tracing::info!(id = %report.id, operation = %report.operation, duration_ms = report.duration_ms, "Operation complete");
        self.last_report.store(Some(Arc::new(report.clone())));
        report
    }

    fn fail(&self, report: ReportBuilder) -> OrchestratorError {
        let report = report.finish();
        let failed = report.failed();
        tracing::error!(id = %report.id, operation = %report.operation, failed = ?failed, "Operation failed");
        self.last_report.store(Some(Arc::new(report.clone())));
        OrchestratorError::OperationFailed {
            operation: report.operation,
            failed,
            report: Box::new(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ControlEvent, EventBus};
    use crate::health::{HealthProbe, MonitorSettings, ProbeError, ProbeSignal};
    use crate::lifecycle::hooks::{HookError, ServiceHooks};
    use crate::registry::{ServiceDescriptor, ServiceKind, ServiceSpec};
    use async_trait::async_trait;
    use dashmap::DashSet;

    /// Up for services started through the hooks, unless listed as broken.
    #[derive(Default)]
    struct Scripted {
        running: DashSet<String>,
        broken: DashSet<String>,
        hang_start: DashSet<String>,
        hang_stop: DashSet<String>,
    }

    #[async_trait]
    impl HealthProbe for Scripted {
        async fn probe(&self, service: &ServiceDescriptor) -> Result<ProbeSignal, ProbeError> {
            if self.running.contains(&service.name) && !self.broken.contains(&service.name) {
                Ok(ProbeSignal::Up)
            } else {
                Err(ProbeError::Status(503))
            }
        }
    }

    #[async_trait]
    impl ServiceHooks for Scripted {
        async fn start(&self, service: &ServiceDescriptor) -> Result<(), HookError> {
            if self.hang_start.contains(&service.name) {
                std::future::pending::<()>().await;
            }
            self.running.insert(service.name.clone());
            Ok(())
        }

        async fn stop(&self, service: &ServiceDescriptor, mode: StopMode) -> Result<(), HookError> {
            if mode == StopMode::Graceful && self.hang_stop.contains(&service.name) {
                std::future::pending::<()>().await;
            }
            self.running.remove(&service.name);
            Ok(())
        }
    }

    fn setup(script: Arc<Scripted>) -> (Arc<ServiceRegistry>, Orchestrator) {
        let registry = Arc::new(ServiceRegistry::new(EventBus::new()));
        registry
            .register_all(vec![
                ServiceSpec::new("db", ServiceKind::Database),
                ServiceSpec::new("cache", ServiceKind::Cache),
                ServiceSpec::new("api", ServiceKind::Gateway).depends_on(["db", "cache"]),
            ])
            .unwrap();
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), script.clone(), MonitorSettings::default()));
        let hooks = Arc::new(HookRegistry::new());
        for name in ["db", "cache", "api"] {
            hooks.register(name, script.clone());
        }
        let settings = OrchestratorSettings {
            startup_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        };
        let orchestrator = Orchestrator::new(registry.clone(), monitor, hooks, settings);
        (registry, orchestrator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_brings_up_levels_in_order() {
        let script = Arc::new(Scripted::default());
        let (registry, orchestrator) = setup(script);

        let report = orchestrator.startup(&[]).await.unwrap();
        assert!(report.success);
        assert_eq!(report.levels, vec![vec!["cache".to_string(), "db".to_string()], vec!["api".to_string()]]);
        for name in ["db", "cache", "api"] {
            assert_eq!(registry.state(name), Some(ServiceState::Healthy));
            assert_eq!(report.outcome(name).unwrap().outcome, Outcome::Started);
        }

        let again = orchestrator.startup(&["api".to_string()]).await.unwrap();
        assert_eq!(again.outcome("api").unwrap().outcome, Outcome::AlreadyRunning);
        assert_eq!(orchestrator.last_report().unwrap().operation, OperationKind::Startup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_aborts_when_dependency_never_converges() {
        let script = Arc::new(Scripted::default());
        script.broken.insert("db".into());
        let (registry, orchestrator) = setup(script);

        let err = orchestrator.startup(&["api".to_string()]).await.unwrap_err();
        let OrchestratorError::OperationFailed { failed, report, .. } = err else {
            panic!("expected operation failure");
        };
        assert_eq!(failed, vec!["db".to_string()]);
        assert_eq!(report.outcome("db").unwrap().outcome, Outcome::TimedOut);
        assert_eq!(report.outcome("cache").unwrap().outcome, Outcome::Started);
        assert_eq!(report.outcome("api").unwrap().outcome, Outcome::Skipped);
        assert_eq!(registry.state("db"), Some(ServiceState::Unhealthy));
        assert_eq!(registry.state("api"), Some(ServiceState::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_dependents_first_and_forces_after_drain() {
        let script = Arc::new(Scripted::default());
        script.hang_stop.insert("api".into());
        let (registry, orchestrator) = setup(script.clone());
        orchestrator.startup(&[]).await.unwrap();

        let mut events = registry.events().subscribe();
        let report = orchestrator.shutdown(&["db".to_string()], true).await.unwrap();
        assert_eq!(report.levels, vec![vec!["api".to_string()], vec!["db".to_string()]]);
        assert_eq!(report.outcome("api").unwrap().outcome, Outcome::ForceStopped);
        assert_eq!(report.outcome("db").unwrap().outcome, Outcome::Stopped);
        assert!(report.outcome("cache").is_none());
        assert_eq!(registry.state("cache"), Some(ServiceState::Healthy));

        let mut stopped = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ControlEvent::StateChanged { service, to: ServiceState::Stopped, .. } = event {
                stopped.push(service);
            }
        }
        assert_eq!(stopped, vec!["api".to_string(), "db".to_string()]);

        let again = orchestrator.shutdown(&["db".to_string()], true).await.unwrap();
        assert_eq!(again.outcome("db").unwrap().outcome, Outcome::AlreadyStopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_requires_satisfied_dependencies() {
        let script = Arc::new(Scripted::default());
        let (registry, orchestrator) = setup(script.clone());
        orchestrator.startup(&[]).await.unwrap();

        registry.transition("db", ServiceState::Unhealthy).unwrap();
        let err = orchestrator.restart("api").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Registry(RegistryError::DependencyUnhealthy { ref dependency, .. }) if dependency == "db"
        ));

        let report = orchestrator.restart("db").await.unwrap();
        assert_eq!(report.operation, OperationKind::Restart);
        assert_eq!(registry.state("db"), Some(ServiceState::Healthy));
        assert!(orchestrator.restart("api").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_start_hook_times_out_and_releases_operations() {
        let script = Arc::new(Scripted::default());
        script.hang_start.insert("db".into());
        let (registry, orchestrator) = setup(script.clone());

        let err = time::timeout(Duration::from_secs(60), orchestrator.startup(&["api".to_string()]))
            .await
            .expect("startup must finish within its budget")
            .unwrap_err();
        let OrchestratorError::OperationFailed { failed, report, .. } = err else {
            panic!("expected operation failure");
        };
        assert_eq!(failed, vec!["db".to_string()]);
        assert_eq!(report.outcome("db").unwrap().outcome, Outcome::TimedOut);
        assert_eq!(report.outcome("cache").unwrap().outcome, Outcome::Started);
        assert_eq!(report.outcome("api").unwrap().outcome, Outcome::Skipped);
        assert_eq!(registry.state("db"), Some(ServiceState::Unhealthy));

        // The operation lock is free again.
        script.hang_start.remove("db");
        orchestrator.restart("db").await.unwrap();
        assert_eq!(registry.state("db"), Some(ServiceState::Healthy));
    }
}
