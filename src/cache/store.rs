//! Cache storage backends.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::StatusCode;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

/// One cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    /// Status the backend answered with.
    pub status: StatusCode,
    pub value: Bytes,
    pub content_type: Option<String>,
    pub ttl: Duration,
    pub created_at: Instant,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Bytes, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            status: StatusCode::OK,
            value,
            content_type: None,
            ttl,
            created_at: Instant::now(),
            hit_count: 0,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Absent once `now - created_at >= ttl`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// Backing store shared by every router task.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Live entry for `key`, counting the hit. Expired entries are removed and reported absent.
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    async fn put(&self, entry: CacheEntry);

    /// Remove every key matching `pattern`; returns how many were removed.
    async fn remove_matching(&self, pattern: &glob::Pattern) -> usize;

    /// Remove every expired entry; returns how many were removed.
    async fn purge_expired(&self) -> usize;

    async fn len(&self) -> usize;
}

/// In-process sharded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.hit_count += 1;
                return Some(entry.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    async fn put(&self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    async fn remove_matching(&self, pattern: &glob::Pattern) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.matches(key));
        before.saturating_sub(self.entries.len())
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    async fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Store statistics exposed by the router metrics endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub errors: u64,
}
