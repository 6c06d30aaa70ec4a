//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! POST /route/{service}/{operation}
//!     → router.rs (in-flight bound, cache lookup)
//!     → load_balancer (eligible backends, strategy)
//!     → resilience::CircuitBreaker (admit or skip)
//!     → client.rs (forward with deadline)
//!     → breaker outcome, cache store or write invalidation
//!     → stats.rs (counters for /router/metrics)
//! ```
//!
//! # Design Decisions
//! - Every request runs on its own task; shared state is atomics and per-key locks
//! - Deterministic failover: a failed backend is never retried within one request

pub mod client;
pub mod router;
pub mod stats;

pub use client::{BackendClient, BackendResponse, ForwardError};
pub use router::{CacheStatus, RequestRouter, RouteError, RoutedResponse, RouterMetrics, RouterSettings};
pub use stats::{RouterStats, RouterStatsSnapshot};
