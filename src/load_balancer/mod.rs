//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Router asks for a backend of logical service S
//!     → pool.rs (backends of S that are healthy, have capacity, pass the router's filter)
//!     → Apply the current strategy:
//!         - round_robin.rs (rotate through candidates)
//!         - least_conn.rs (fewest in-flight, ties rotate)
//!         - weighted.rs (random, proportional to weight)
//!     → backend.rs (RAII guard counts the in-flight request)
//! ```
//!
//! # Design Decisions
//! - Strategies see only eligible candidates; filtering lives in the pool
//! - Strategy is swapped at runtime with arc-swap, never locked
//! - Backend health follows registry/health events for its monitor service

pub mod backend;
pub mod least_conn;
pub mod pool;
pub mod round_robin;
pub mod weighted;

use std::sync::Arc;

use crate::config::LoadBalancingStrategy;

pub use backend::{Backend, BackendConnectionGuard, BackendStats, RoutingCandidate};
pub use least_conn::LeastConnections;
pub use pool::BackendPools;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRandom;

/// Selection algorithm over eligible candidates.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}

/// One implementation per strategy, chosen at runtime.
#[derive(Debug)]
pub enum Balancer {
    RoundRobin(RoundRobin),
    LeastConnections(LeastConnections),
    WeightedRandom(WeightedRandom),
}

impl Balancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        match strategy {
            LoadBalancingStrategy::RoundRobin => Self::RoundRobin(RoundRobin::new()),
            LoadBalancingStrategy::LeastConnections => Self::LeastConnections(LeastConnections::new()),
            LoadBalancingStrategy::WeightedRandom => Self::WeightedRandom(WeightedRandom::new()),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        match self {
            Self::RoundRobin(_) => LoadBalancingStrategy::RoundRobin,
            Self::LeastConnections(_) => LoadBalancingStrategy::LeastConnections,
            Self::WeightedRandom(_) => LoadBalancingStrategy::WeightedRandom,
        }
    }
}

impl LoadBalancer for Balancer {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        match self {
            Self::RoundRobin(lb) => lb.next_server(backends),
            Self::LeastConnections(lb) => lb.next_server(backends),
            Self::WeightedRandom(lb) => lb.next_server(backends),
        }
    }
}
