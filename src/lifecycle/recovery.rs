//! Automatic recovery of failed services.
//!
//! # State Transitions
//! ```text
//! Healthy/Degraded ──ServiceFailed──▶ Recovering(1)
//! Recovering(n) ──restart ok──▶ Healthy (tracker dropped, dependents recovered)
//! Recovering(n) ──restart failed, n < max──▶ delay ──▶ Recovering(n+1)
//! Recovering(max) ──restart failed──▶ Exhausted (quarantined, alert)
//! Exhausted ──manual restart, Healthy──▶ tracker dropped
//! ```

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::RecoveryConfig;
use crate::events::{ControlEvent, EventBus};
use crate::lifecycle::orchestrator::Orchestrator;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::registry::{ServiceRegistry, ServiceState};
use crate::resilience::Backoff;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("recovery of '{service}' exhausted after {attempts} attempts")]
    Exhausted { service: String, attempts: u32 },

    #[error("service '{0}' is already being recovered")]
    AlreadyRecovering(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RecoveryPhase {
    Recovering { attempt: u32 },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub service: String,
    #[serde(flatten)]
    pub phase: RecoveryPhase,
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl From<&RecoveryConfig> for RecoverySettings {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_retries: config.max_retries,
            backoff: Backoff::from(config),
        }
    }
}

pub struct RecoveryManager {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<ServiceRegistry>,
    events: EventBus,
    settings: RecoverySettings,
    trackers: DashMap<String, RecoveryPhase>,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl RecoveryManager {
    pub fn new(orchestrator: Arc<Orchestrator>, registry: Arc<ServiceRegistry>, settings: RecoverySettings) -> Self {
        let events = registry.events().clone();
        Self {
            orchestrator,
            registry,
            events,
            settings,
            trackers: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    pub fn phase(&self, service: &str) -> Option<RecoveryPhase> {
        self.trackers.get(service).map(|p| *p)
    }

    pub fn status(&self) -> Vec<RecoveryStatus> {
        let mut status: Vec<RecoveryStatus> = self
            .trackers
            .iter()
            .map(|t| RecoveryStatus {
                service: t.key().clone(),
                phase: *t.value(),
            })
            .collect();
        status.sort_by(|a, b| a.service.cmp(&b.service));
        status
    }

    /// React to failure events until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        if !self.settings.enabled {
            tracing::info!("Automatic recovery disabled");
            return;
        }
        tracing::info!(
            max_retries = self.settings.max_retries,
            delay = ?self.settings.backoff.base,
            exponential = self.settings.backoff.exponential,
            "Recovery manager starting"
        );

        let mut events = self.events.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ControlEvent::ServiceFailed { service, previous, .. }) => {
                        if matches!(previous, ServiceState::Healthy | ServiceState::Degraded) {
                            self.spawn_recovery(service);
                        } else {
                            tracing::debug!(service = %service, %previous, "Failure outside steady state, not recovering");
                        }
                    }
                    Ok(ControlEvent::StateChanged { service, to: ServiceState::Healthy, .. }) => {
                        let cleared = self
                            .trackers
                            .remove_if(&service, |_, phase| matches!(phase, RecoveryPhase::Exhausted { .. }));
                        if cleared.is_some() {
                            tracing::info!(service = %service, "Exhausted service healthy again");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Recovery manager lagged on events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.wait() => {
                    tracing::info!("Recovery manager received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        self.tasks.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    fn spawn_recovery(self: &Arc<Self>, service: String) {
        if self.tasks.get(&service).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let this = self.clone();
        let name = service.clone();
        let handle = tokio::spawn(async move {
            if this.recover(&name).await.is_ok() {
                for dependent in this.dependents_to_recover(&name) {
                    this.spawn_recovery(dependent);
                }
            }
        });
        self.tasks.insert(service, handle);
    }

    /// Restart `service` until it converges or the attempt budget is spent.
    ///
    /// Returns the number of attempts used.
    pub async fn recover(&self, service: &str) -> Result<u32, RecoveryError> {
        match self.trackers.entry(service.to_string()) {
            Entry::Occupied(e) if matches!(e.get(), RecoveryPhase::Recovering { .. }) => {
                return Err(RecoveryError::AlreadyRecovering(service.to_string()));
            }
            Entry::Occupied(mut e) => {
                e.insert(RecoveryPhase::Recovering { attempt: 0 });
            }
            Entry::Vacant(e) => {
                e.insert(RecoveryPhase::Recovering { attempt: 0 });
            }
        }

        let max = self.settings.max_retries.max(1);
        for attempt in 1..=max {
            self.trackers
                .insert(service.to_string(), RecoveryPhase::Recovering { attempt });
            tracing::warn!(service = %service, attempt, max, "Attempting recovery");
            metrics::record_recovery(service, "attempt");
            self.events.publish(ControlEvent::RecoveryStarted {
                service: service.to_string(),
                attempt,
            });

            match self.orchestrator.restart(service).await {
                Ok(_) => {
                    self.trackers.remove(service);
                    tracing::info!(service = %service, attempts = attempt, "Recovery succeeded");
                    metrics::record_recovery(service, "succeeded");
                    self.events.publish(ControlEvent::RecoverySucceeded {
                        service: service.to_string(),
                        attempts: attempt,
                    });
                    return Ok(attempt);
                }
                Err(e) => {
                    tracing::warn!(service = %service, attempt, error = %e, "Recovery attempt failed");
                }
            }

            if attempt < max {
                tokio::time::sleep(self.settings.backoff.delay(attempt)).await;
            }
        }

        self.trackers
            .insert(service.to_string(), RecoveryPhase::Exhausted { attempts: max });
        if let Err(e) = self.registry.quarantine(service) {
            tracing::warn!(service = %service, error = %e, "Failed to quarantine service");
        }
        tracing::error!(
            service = %service,
            attempts = max,
            "Recovery exhausted, service quarantined until manual restart"
        );
        metrics::record_recovery(service, "exhausted");
        self.events.publish(ControlEvent::RecoveryExhausted {
            service: service.to_string(),
            attempts: max,
        });
        Err(RecoveryError::Exhausted {
            service: service.to_string(),
            attempts: max,
        })
    }

    /// Dependents that went down with `service` and can come back now.
    fn dependents_to_recover(&self, service: &str) -> Vec<String> {
        let Some(descriptor) = self.registry.get(service) else {
            return Vec::new();
        };
        descriptor
            .dependents
            .iter()
            .filter(|name| {
                self.registry.get(name).is_some_and(|d| {
                    matches!(d.state, ServiceState::Unhealthy | ServiceState::Starting) && !d.quarantined
                })
            })
            .filter(|name| matches!(self.registry.unsatisfied_dependency(name), Ok(None)))
            .cloned()
            .collect()
    }
}
