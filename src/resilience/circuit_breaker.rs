//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, failures counted in a rolling window
//! - Open: backend assumed down, calls rejected without a network attempt
//! - Half-Open: exactly one trial call allowed
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures within window >= threshold
//! Open → Half-Open: first acquire after open_timeout
//! Half-Open → Closed: trial succeeds (failure window cleared)
//! Half-Open → Open: trial fails (timeout clock restarted)
//! ```
//!
//! # Design Decisions
//! - One lock per backend; breakers for unrelated backends never contend
//! - Only router-reported outcomes move the state machine
//! - A trial that never reports back is replaced after open_timeout

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned instead of attempting a call through an open circuit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for backend '{backend}'")]
pub struct CircuitOpenError {
    pub backend: String,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub threshold: u32,
    pub window: Duration,
    pub open_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            threshold: config.threshold,
            window: Duration::from_secs(config.window_secs),
            open_timeout: Duration::from_secs(config.open_timeout_secs),
        }
    }
}

/// Reportable breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub backend_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds since the Unix epoch.
    pub last_transition_time: u64,
    pub threshold: u32,
    pub open_timeout_ms: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
    last_transition: SystemTime,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    backend_id: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            backend_id: backend_id.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_started: None,
                last_transition: SystemTime::now(),
            }),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Ask permission for one call.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| now.duration_since(t)).unwrap_or_default();
                if elapsed >= self.settings.open_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => match inner.trial_started {
                Some(started) if now.duration_since(started) < self.settings.open_timeout => Err(self.open_error()),
                _ => {
                    inner.trial_started = Some(now);
                    Ok(())
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.failures.clear();
            inner.trial_started = None;
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                self.prune(&mut inner, now);
                inner.failures.push_back(now);
                if inner.failures.len() as u32 >= self.settings.threshold {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.trial_started = None;
                inner.opened_at = Some(now);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Whether a call could currently be admitted. Does not consume the half-open trial.
    pub fn is_routable(&self) -> bool {
        let inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .is_none_or(|t| now.duration_since(t) >= self.settings.open_timeout),
            CircuitState::HalfOpen => inner
                .trial_started
                .is_none_or(|t| now.duration_since(t) >= self.settings.open_timeout),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let mut inner = self.lock();
        self.prune(&mut inner, Instant::now());
        CircuitBreakerState {
            backend_id: self.backend_id.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            last_transition_time: inner
                .last_transition
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            threshold: self.settings.threshold,
            open_timeout_ms: self.settings.open_timeout.as_millis() as u64,
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) >= self.settings.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = SystemTime::now();
        match to {
            CircuitState::Open => tracing::warn!(backend = %self.backend_id, ?from, "Circuit opened"),
            _ => tracing::info!(backend = %self.backend_id, ?from, ?to, "Circuit state changed"),
        }
        metrics::record_circuit_transition(&self.backend_id, to);
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            backend: self.backend_id.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }
}

/// Breakers keyed by backend id, created on first use.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: BreakerSettings,
}

impl CircuitBreakers {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    pub fn get(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(backend_id) {
            return existing.clone();
        }
        self.breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(backend_id, self.settings.clone())))
            .clone()
    }

    pub fn is_routable(&self, backend_id: &str) -> bool {
        self.breakers.get(backend_id).is_none_or(|b| b.is_routable())
    }

    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        all
    }
}
