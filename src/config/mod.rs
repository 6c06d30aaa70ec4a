//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, cycle detection)
//!     → ControlPlaneConfig (validated, immutable)
//!     → ControlPlane::new builds every subsystem from it
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → strategy and cache policies swapped atomically
//!     → everything else logged as requiring a restart
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ApiConfig, BackendConfig, CacheConfig, CachePolicyConfig, CacheSample, CircuitBreakerConfig, ControlPlaneConfig,
    HealthCheckConfig, LoadBalancingStrategy, LogFormat, ObservabilityConfig, OrchestratorConfig, RecoveryConfig,
    RouterConfig, ServiceConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
