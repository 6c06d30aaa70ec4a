//! Cache manager: policies, bounded store access, invalidation and warming.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::StatusCode;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};

use crate::cache::key::cache_key;
use crate::cache::store::{CacheEntry, CacheStats, CacheStore, MemoryStore};
use crate::config::{CacheConfig, CachePolicyConfig, CacheSample};
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid cache pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("cache is disabled")]
    Disabled,

    #[error("no warming queries supplied or configured for '{0}'")]
    NoWarmQueries(String),
}

fn compile(pattern: &str) -> Result<glob::Pattern, CacheError> {
    glob::Pattern::new(pattern).map_err(|e| CacheError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Compiled caching rules for one operation class.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub pattern: glob::Pattern,
    pub ttl: Duration,
    pub cacheable: bool,
    pub invalidates: Vec<glob::Pattern>,
}

impl CachePolicy {
    pub fn compile(config: &CachePolicyConfig) -> Result<Self, CacheError> {
        Ok(Self {
            pattern: compile(&config.pattern)?,
            ttl: Duration::from_secs(config.ttl_secs),
            cacheable: config.cacheable && config.ttl_secs > 0,
            invalidates: config
                .invalidates
                .iter()
                .map(|p| compile(p))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// A successful backend response, as stored in the cache.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Fetches a query through the backend path, bypassing the cache.
#[async_trait]
pub trait WarmSource: Send + Sync {
    async fn fetch(&self, service: &str, operation: &str, params: &Value) -> Result<Fetched, String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmReport {
    pub service: String,
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_ratio: f64,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

pub struct CacheManager {
    enabled: bool,
    store: Arc<dyn CacheStore>,
    policies: ArcSwap<Vec<CachePolicy>>,
    samples: ArcSwap<BTreeMap<String, Vec<CacheSample>>>,
    store_timeout: Duration,
    counters: Counters,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Result<Self, CacheError> {
        let policies = compile_policies(&config.policies)?;
        Ok(Self {
            enabled: config.enabled,
            store,
            policies: ArcSwap::from_pointee(policies),
            samples: ArcSwap::from_pointee(config.samples.clone()),
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            counters: Counters::default(),
        })
    }

    pub fn in_memory(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn key(&self, service: &str, operation: &str, params: &Value) -> String {
        cache_key(service, operation, params)
    }

    /// First policy whose pattern matches `operation`.
    pub fn policy_for(&self, operation: &str) -> Option<CachePolicy> {
        self.policies
            .load()
            .iter()
            .find(|p| p.pattern.matches(operation))
            .cloned()
    }

    /// Swap policies and samples. Nothing changes if any pattern fails to compile.
    pub fn reload(&self, config: &CacheConfig) -> Result<(), CacheError> {
        let policies = compile_policies(&config.policies)?;
        let count = policies.len();
        self.policies.store(Arc::new(policies));
        self.samples.store(Arc::new(config.samples.clone()));
        tracing::info!(policies = count, "Cache policies reloaded");
        Ok(())
    }

    /// Live entry for `key`. Store errors and timeouts count as a miss.
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        match time::timeout(self.store_timeout, self.store.get(key)).await {
            Ok(Some(entry)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache("hit");
                Some(entry)
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache("miss");
                None
            }
            Err(_) => {
                self.store_error("get", key);
                None
            }
        }
    }

    pub async fn store(&self, key: &str, response: Fetched, ttl: Duration) -> bool {
        if !self.enabled || ttl.is_zero() {
            return false;
        }
        let entry = CacheEntry::new(key, response.body, ttl)
            .with_status(response.status)
            .with_content_type(response.content_type);
        match time::timeout(self.store_timeout, self.store.put(entry)).await {
            Ok(()) => {
                self.counters.stores.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache("store");
                true
            }
            Err(_) => {
                self.store_error("put", key);
                false
            }
        }
    }

    /// Remove every key matching the glob `pattern`.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize, CacheError> {
        let compiled = compile(pattern)?;
        self.invalidate_compiled(&compiled).await
    }

    /// Apply a write operation's `invalidates` patterns.
    pub async fn invalidate_for(&self, policy: &CachePolicy) -> usize {
        let mut removed = 0;
        for pattern in &policy.invalidates {
            match self.invalidate_compiled(pattern).await {
                Ok(n) => removed += n,
                Err(e) => tracing::warn!(pattern = %pattern, error = %e, "Write invalidation failed"),
            }
        }
        removed
    }

    async fn invalidate_compiled(&self, pattern: &glob::Pattern) -> Result<usize, CacheError> {
        let removed = time::timeout(self.store_timeout, self.store.remove_matching(pattern))
            .await
            .map_err(|_| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                CacheError::Timeout(self.store_timeout)
            })?;
        self.counters.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        metrics::record_cache("invalidate");
        tracing::debug!(pattern = %pattern, removed, "Cache invalidated");
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> usize {
        self.store.purge_expired().await
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            entries: self.store.len().await,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Configured warming queries for `service`, at most `limit`.
    pub fn samples_for(&self, service: &str, limit: usize) -> Vec<CacheSample> {
        self.samples
            .load()
            .get(service)
            .map(|s| s.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Fetch `queries` (or the configured samples) through `source` and store the results.
    pub async fn warm(
        &self,
        source: &dyn WarmSource,
        service: &str,
        sample_size: usize,
        queries: Option<Vec<CacheSample>>,
    ) -> Result<WarmReport, CacheError> {
        if !self.enabled {
            return Err(CacheError::Disabled);
        }
        let queries: Vec<CacheSample> = match queries {
            Some(q) => q.into_iter().take(sample_size).collect(),
            None => self.samples_for(service, sample_size),
        };
        if queries.is_empty() {
            tracing::warn!(service = %service, sample_size, "Nothing to warm");
            return Err(CacheError::NoWarmQueries(service.to_string()));
        }

        let outcomes = join_all(queries.iter().map(|q| self.warm_one(source, service, q))).await;

        let requested = outcomes.len();
        let errors: Vec<String> = outcomes.into_iter().filter_map(Result::err).collect();
        let succeeded = requested - errors.len();
        let success_ratio = succeeded as f64 / requested as f64;

        tracing::info!(service = %service, requested, succeeded, "Cache warmed");
        Ok(WarmReport {
            service: service.to_string(),
            requested,
            succeeded,
            failed: errors.len(),
            success_ratio,
            errors,
        })
    }

    async fn warm_one(&self, source: &dyn WarmSource, service: &str, query: &CacheSample) -> Result<(), String> {
        let policy = self
            .policy_for(&query.operation)
            .filter(|p| p.cacheable)
            .ok_or_else(|| format!("{}: operation is not cacheable", query.operation))?;

        let fetched = source
            .fetch(service, &query.operation, &query.params)
            .await
            .map_err(|e| format!("{}: {e}", query.operation))?;

        let key = self.key(service, &query.operation, &query.params);
        if self.store(&key, fetched, policy.ttl).await {
            Ok(())
        } else {
            Err(format!("{}: store failed", query.operation))
        }
    }

    /// Remove expired entries periodically until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    let removed = self.purge_expired().await;
                    if removed > 0 {
                        tracing::debug!(removed, "Expired cache entries swept");
                    }
                }
            }
        }
        tracing::debug!("Cache sweeper stopped");
    }

    fn store_error(&self, op: &'static str, key: &str) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache("error");
        tracing::warn!(op, key = %key, timeout = ?self.store_timeout, "Cache store operation timed out");
    }
}

fn compile_policies(configs: &[CachePolicyConfig]) -> Result<Vec<CachePolicy>, CacheError> {
    configs.iter().map(CachePolicy::compile).collect()
}
