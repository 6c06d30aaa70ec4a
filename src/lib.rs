//! Orchestration and routing control plane.
//!
//! Starts, stops and recovers a graph of dependent backend services in
//! dependency order, watches their health, and routes operation calls to
//! their backends with load balancing, circuit breaking and response caching.

pub mod admin;
pub mod cache;
pub mod config;
pub mod events;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod registry;
pub mod resilience;
pub mod routing;

pub use config::ControlPlaneConfig;
pub use http::ApiServer;
pub use lifecycle::{ControlPlane, Shutdown};
