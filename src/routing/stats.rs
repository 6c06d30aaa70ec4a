//! Router counters.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default)]
struct BackendCounters {
    requests: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Default)]
pub struct RouterStats {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    succeeded: AtomicU64,
    unavailable: AtomicU64,
    rejected: AtomicU64,
    failed_calls: AtomicU64,
    circuit_skips: AtomicU64,
    backends: DashMap<String, BackendCounters>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub succeeded: u64,
    pub unavailable: u64,
    pub rejected: u64,
    pub failed_calls: u64,
    pub circuit_skips: u64,
    pub backends: Vec<BackendCallStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendCallStats {
    pub backend_id: String,
    pub requests: u64,
    pub failures: u64,
}

impl RouterStats {
    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_skip(&self) {
        self.circuit_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_call(&self, backend_id: &str, ok: bool) {
        let counters = self.backends.entry(backend_id.to_string()).or_default();
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        let mut backends: Vec<_> = self
            .backends
            .iter()
            .map(|entry| BackendCallStats {
                backend_id: entry.key().clone(),
                requests: entry.requests.load(Ordering::Relaxed),
                failures: entry.failures.load(Ordering::Relaxed),
            })
            .collect();
        backends.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));

        RouterStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            circuit_skips: self.circuit_skips.load(Ordering::Relaxed),
            backends,
        }
    }
}
