//! Weighted random load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Picks a backend with probability proportional to its static weight.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for WeightedRandom {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let total: u64 = backends.iter().map(|b| u64::from(b.weight)).sum();
        if total == 0 {
            return None;
        }

        let mut roll = fastrand::u64(0..total);
        for backend in backends {
            let weight = u64::from(backend.weight);
            if roll < weight {
                return Some(backend.clone());
            }
            roll -= weight;
        }
        backends.last().cloned()
    }
}
