//! Control-plane event bus.
//!
//! # Data Flow
//! ```text
//! ServiceRegistry ──StateChanged/ServiceRegistered──┐
//! HealthMonitor ───HealthChanged/ServiceFailed/─────┤
//!                  ServiceRecovered                 ├──▶ broadcast ──▶ subscribers
//! RecoveryManager ─Recovery*────────────────────────┘
//!
//! Subscribers:
//!     HealthMonitor    (spawn probes for new services)
//!     RecoveryManager  (ServiceFailed → restart loop)
//!     BackendPools     (HealthChanged → candidate filtering)
//!     Orchestrator     (StateChanged → convergence wait)
//! ```
//!
//! # Design Decisions
//! - Publishers never block; lagging subscribers re-read state from the registry
//! - Components subscribe instead of calling each other directly

use serde::Serialize;
use tokio::sync::broadcast;

use crate::health::HealthStatus;
use crate::registry::ServiceState;

const DEFAULT_CAPACITY: usize = 1024;

/// Events published by control-plane components.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    ServiceRegistered {
        service: String,
    },
    StateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },
    HealthChanged {
        service: String,
        status: HealthStatus,
    },
    /// Health crossed into `Unhealthy`.
    ServiceFailed {
        service: String,
        previous: ServiceState,
        consecutive_failures: u32,
    },
    /// Health returned to `Healthy`.
    ServiceRecovered {
        service: String,
    },
    RecoveryStarted {
        service: String,
        attempt: u32,
    },
    RecoverySucceeded {
        service: String,
        attempts: u32,
    },
    /// Automatic recovery gave up. Operator attention required.
    RecoveryExhausted {
        service: String,
        attempts: u32,
    },
}

impl ControlEvent {
    pub fn service(&self) -> &str {
        match self {
            ControlEvent::ServiceRegistered { service }
            | ControlEvent::StateChanged { service, .. }
            | ControlEvent::HealthChanged { service, .. }
            | ControlEvent::ServiceFailed { service, .. }
            | ControlEvent::ServiceRecovered { service }
            | ControlEvent::RecoveryStarted { service, .. }
            | ControlEvent::RecoverySucceeded { service, .. }
            | ControlEvent::RecoveryExhausted { service, .. } => service,
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ControlEvent) {
        tracing::trace!(?event, "Publishing control event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ControlEvent::ServiceRecovered { service: "db".into() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.service(), "db");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(ControlEvent::ServiceRegistered { service: "db".into() });
    }
}
