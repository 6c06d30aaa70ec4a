//! Least Connections load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Least connections selector.
/// Selects the backend with the fewest in-flight requests; ties rotate.
#[derive(Debug, Default)]
pub struct LeastConnections {
    tie_breaker: AtomicUsize,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let min = backends.iter().map(|b| b.connections()).min()?;
        let tied: Vec<&Arc<Backend>> = backends.iter().filter(|b| b.connections() == min).collect();
        if tied.is_empty() {
            // Counts moved between the two passes.
            return backends.iter().min_by_key(|b| b.connections()).cloned();
        }
        let index = self.tie_breaker.fetch_add(1, Ordering::Relaxed) % tied.len();
        Some(tied[index].clone())
    }
}
