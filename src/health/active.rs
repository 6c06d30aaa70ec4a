//! Active health monitoring.
//!
//! # Responsibilities
//! - One periodic probe task per registered service
//! - Cap in-flight probes with a global semaphore
//! - Aggregate results on a single task and request registry transitions
//! - Publish health, failure and recovery events

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::events::{ControlEvent, EventBus};
use crate::health::probe::{HealthProbe, ProbeError, ProbeSignal};
use crate::health::state::{HealthCheckResult, HealthStatus, HealthTracker, HealthWindow};
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::registry::{ServiceRegistry, ServiceState};

/// Runtime settings for the monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub default_interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub max_concurrent_probes: usize,
    pub history_len: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&HealthCheckConfig::default())
    }
}

impl From<&HealthCheckConfig> for MonitorSettings {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            default_interval: Duration::from_secs(config.interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            unhealthy_threshold: config.unhealthy_threshold,
            max_concurrent_probes: config.max_concurrent_probes,
            history_len: config.history_len,
        }
    }
}

/// Snapshot entry for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub latest: Option<HealthCheckResult>,
    pub window: HealthWindow,
}

/// Aggregate health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub services: Vec<ServiceHealth>,
}

struct ProbeReport {
    service: String,
    outcome: Result<ProbeSignal, ProbeError>,
    latency: Duration,
}

pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    probe: Arc<dyn HealthProbe>,
    settings: MonitorSettings,
    trackers: DashMap<String, HealthTracker>,
    permits: Arc<Semaphore>,
    tasks: DashMap<String, JoinHandle<()>>,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ServiceRegistry>, probe: Arc<dyn HealthProbe>, settings: MonitorSettings) -> Self {
        let events = registry.events().clone();
        Self {
            permits: Arc::new(Semaphore::new(settings.max_concurrent_probes.max(1))),
            registry,
            probe,
            settings,
            trackers: DashMap::new(),
            tasks: DashMap::new(),
            events,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Probe `service` immediately, outside its periodic schedule.
    pub async fn check_now(&self, service: &str) -> Option<HealthCheckResult> {
        let descriptor = self.registry.get(service)?;
        let _permit = self.permits.acquire().await.ok()?;
        let started = Instant::now();
        let outcome = match time::timeout(self.settings.timeout, self.probe.probe(&descriptor)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeError::Timeout(self.settings.timeout)),
        };
        Some(self.observe(service, outcome, started.elapsed()))
    }

    /// Probe every registered service until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        tracing::info!(
            interval = ?self.settings.default_interval,
            timeout = ?self.settings.timeout,
            max_concurrent = self.settings.max_concurrent_probes,
            "Health monitor starting"
        );

        let (tx, mut rx) = mpsc::channel::<ProbeReport>(256);
        let mut events = self.events.subscribe();
        for name in self.registry.names() {
            self.spawn_probe(name, tx.clone());
        }

        loop {
            tokio::select! {
                Some(report) = rx.recv() => {
                    self.observe(&report.service, report.outcome, report.latency);
                }
                event = events.recv() => match event {
                    Ok(ControlEvent::ServiceRegistered { service }) => self.spawn_probe(service, tx.clone()),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Health monitor lagged on events, resyncing probes");
                        for name in self.registry.names() {
                            self.spawn_probe(name, tx.clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.wait() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        self.tasks.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    fn spawn_probe(&self, service: String, tx: mpsc::Sender<ProbeReport>) {
        if self.tasks.get(&service).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let interval = self
            .registry
            .get(&service)
            .and_then(|d| d.probe_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_interval);

        let registry = self.registry.clone();
        let probe = self.probe.clone();
        let permits = self.permits.clone();
        let timeout = self.settings.timeout;
        let name = service.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(descriptor) = registry.get(&name) else {
                    tracing::debug!(service = %name, "Service deregistered, stopping probe");
                    break;
                };
                if !descriptor.state.is_monitored() {
                    continue;
                }
                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                let started = Instant::now();
                let outcome = match time::timeout(timeout, probe.probe(&descriptor)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProbeError::Timeout(timeout)),
                };
                let report = ProbeReport {
                    service: name.clone(),
                    outcome,
                    latency: started.elapsed(),
                };
                if tx.send(report).await.is_err() {
                    break;
                }
            }
        });

        tracing::debug!(service = %service, interval = ?interval, "Probe task spawned");
        self.tasks.insert(service, handle);
    }

    /// Fold one probe outcome into the service's health state.
    pub fn observe(
        &self,
        service: &str,
        outcome: Result<ProbeSignal, ProbeError>,
        latency: Duration,
    ) -> HealthCheckResult {
        if let Err(e) = &outcome {
            tracing::warn!(service = %service, error = %e, "Health check failed");
        }

        let observation = self
            .trackers
            .entry(service.to_string())
            .or_insert_with(|| HealthTracker::new(self.settings.unhealthy_threshold, self.settings.history_len))
            .record(service, &outcome, latency);
        let status = observation.result.status;
        metrics::record_probe(service, status, latency);

        let before = self.registry.state(service).unwrap_or_default();
        // A failing probe never promotes a service that has not come up yet.
        let not_up = matches!(before, ServiceState::Starting | ServiceState::Unknown);
        if !(outcome.is_err() && not_up && status != HealthStatus::Unhealthy) {
            self.registry.apply_health(service, status);
        }

        if observation.changed() {
            tracing::info!(service = %service, from = %observation.previous, to = %status, "Health status changed");
            metrics::record_service_health(service, status);
            self.events.publish(ControlEvent::HealthChanged {
                service: service.to_string(),
                status,
            });

            match (observation.previous, status) {
                (prev, HealthStatus::Unhealthy) if prev != HealthStatus::Unhealthy => {
                    tracing::error!(
                        service = %service,
                        consecutive_failures = observation.result.consecutive_failures,
                        "Service unhealthy"
                    );
                    self.events.publish(ControlEvent::ServiceFailed {
                        service: service.to_string(),
                        previous: before,
                        consecutive_failures: observation.result.consecutive_failures,
                    });
                }
                (HealthStatus::Degraded | HealthStatus::Unhealthy, HealthStatus::Healthy) => {
                    tracing::info!(service = %service, "Service recovered");
                    self.events.publish(ControlEvent::ServiceRecovered {
                        service: service.to_string(),
                    });
                }
                _ => {}
            }
        }

        observation.result
    }

    pub fn status(&self, service: &str) -> HealthStatus {
        self.trackers.get(service).map(|t| t.status()).unwrap_or_default()
    }

    pub fn history(&self, service: &str) -> Vec<HealthCheckResult> {
        self.trackers
            .get(service)
            .map(|t| t.history().cloned().collect())
            .unwrap_or_default()
    }

    /// Per-service results plus a worst-of aggregate.
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut services: Vec<ServiceHealth> = self
            .registry
            .names()
            .into_iter()
            .map(|name| match self.trackers.get(&name) {
                Some(t) => ServiceHealth {
                    status: t.status(),
                    latest: t.latest().cloned(),
                    window: t.window(),
                    service: name,
                },
                None => ServiceHealth {
                    status: HealthStatus::Unknown,
                    latest: None,
                    window: HealthTracker::new(1, 1).window(),
                    service: name,
                },
            })
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        HealthSnapshot {
            status: aggregate(&self.registry, &services),
            services,
        }
    }
}

/// Worst status across services; an unhealthy non-critical service only degrades the aggregate.
fn aggregate(registry: &ServiceRegistry, services: &[ServiceHealth]) -> HealthStatus {
    if services.is_empty() || services.iter().all(|s| s.status == HealthStatus::Unknown) {
        return HealthStatus::Unknown;
    }
    let mut overall = HealthStatus::Healthy;
    for s in services {
        let stopped = matches!(registry.state(&s.service), Some(ServiceState::Stopped));
        match s.status {
            HealthStatus::Healthy => {}
            HealthStatus::Unhealthy if registry.get(&s.service).is_some_and(|d| d.critical) && !stopped => {
                return HealthStatus::Unhealthy;
            }
            _ => overall = HealthStatus::Degraded,
        }
    }
    overall
}
