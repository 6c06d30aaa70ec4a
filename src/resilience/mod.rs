//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → circuit_breaker.rs (reject without a network attempt while open)
//!     → router forwards, reports success or failure back to the breaker
//!
//! Failed service:
//!     → recovery manager waits backoff.rs delay between attempts
//! ```
//!
//! # Design Decisions
//! - Breakers are per backend, never per service
//! - Circuit breaker prevents cascading failures

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::Backoff;
pub use circuit_breaker::{
    BreakerSettings, CircuitBreaker, CircuitBreakerState, CircuitBreakers, CircuitOpenError, CircuitState,
};
