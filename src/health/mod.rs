//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Per-service probe task (active.rs):
//!     interval tick
//!     → acquire global probe permit
//!     → probe.rs (HTTP GET health_endpoint, bounded by timeout)
//!     → mpsc → aggregator
//!
//! Aggregator (active.rs):
//!     → state.rs (consecutive failures → Healthy/Degraded/Unhealthy)
//!     → ServiceRegistry::apply_health
//!     → HealthChanged / ServiceFailed / ServiceRecovered events
//! ```
//!
//! # Design Decisions
//! - A slow probe only delays its own service
//! - Health state is per service; the monitor owns result history

pub mod active;
pub mod probe;
pub mod state;

pub use active::{HealthMonitor, HealthSnapshot, MonitorSettings, ServiceHealth};
pub use probe::{HealthProbe, HttpProbe, ProbeError, ProbeSignal};
pub use state::{HealthCheckResult, HealthStatus, HealthTracker, HealthWindow};
