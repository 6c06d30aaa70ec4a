//! Per-service health state machine.
//!
//! # State Transitions
//! ```text
//! probe ok                   → Healthy   (failures = 0)
//! probe ok, degraded signal  → Degraded  (failures = 0)
//! probe failed               → failures += 1
//!     1 ≤ failures < threshold → Degraded
//!     failures ≥ threshold     → Unhealthy
//! ```
//!
//! # Design Decisions
//! - Last N results retained for windowed analysis
//! - A timed-out probe is one ordinary failure

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::health::probe::{ProbeError, ProbeSignal};

/// Health status as observed by probes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown = 0,
    Healthy = 1,
    Degraded = 2,
    Unhealthy = 3,
}

impl From<u8> for HealthStatus {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthStatus::Healthy,
            2 => HealthStatus::Degraded,
            3 => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub service_name: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregates over the retained history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthWindow {
    pub samples: usize,
    pub success_ratio: f64,
    pub mean_latency_ms: f64,
}

/// Result of recording a probe.
#[derive(Debug, Clone)]
pub struct Observation {
    pub previous: HealthStatus,
    pub result: HealthCheckResult,
}

impl Observation {
    pub fn changed(&self) -> bool {
        self.previous != self.result.status
    }
}

/// Rolling health state for one service.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    history: VecDeque<HealthCheckResult>,
    capacity: usize,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, capacity: usize) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn latest(&self) -> Option<&HealthCheckResult> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.history.iter()
    }

    /// Record a probe outcome; the new result supersedes the previous one.
    pub fn record(
        &mut self,
        service: &str,
        outcome: &Result<ProbeSignal, ProbeError>,
        latency: Duration,
    ) -> Observation {
        let previous = self.status;
        let error = match outcome {
            Ok(ProbeSignal::Up) => {
                self.consecutive_failures = 0;
                self.status = HealthStatus::Healthy;
                None
            }
            Ok(ProbeSignal::Degraded) => {
                self.consecutive_failures = 0;
                self.status = HealthStatus::Degraded;
                None
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.status = if self.consecutive_failures >= self.unhealthy_threshold {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
                Some(e.to_string())
            }
        };

        let result = HealthCheckResult {
            service_name: service.to_string(),
            status: self.status,
            latency_ms: latency.as_millis() as u64,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            consecutive_failures: self.consecutive_failures,
            error,
        };

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(result.clone());

        Observation { previous, result }
    }

    pub fn window(&self) -> HealthWindow {
        let samples = self.history.len();
        if samples == 0 {
            return HealthWindow {
                samples,
                success_ratio: 0.0,
                mean_latency_ms: 0.0,
            };
        }
        let successes = self.history.iter().filter(|r| r.error.is_none()).count();
        let total_latency: u64 = self.history.iter().map(|r| r.latency_ms).sum();
        HealthWindow {
            samples,
            success_ratio: successes as f64 / samples as f64,
            mean_latency_ms: total_latency as f64 / samples as f64,
        }
    }
}
