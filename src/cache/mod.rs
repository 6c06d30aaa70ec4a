//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! Router request (service, operation, params)
//!     → key.rs (canonical params → sha256 key)
//!     → manager.rs (policy lookup: first glob match on operation)
//!     → store.rs (bounded get; expired entries are absent)
//!     → hit: respond, miss: forward, then store on 2xx
//!
//! Write operation succeeded
//!     → manager.rs (policy.invalidates → remove matching keys)
//! ```
//!
//! # Design Decisions
//! - Every store call has a deadline; a slow store degrades to a miss
//! - Policies swap atomically on config reload
//! - Expiry is lazy on read plus a periodic sweeper

pub mod key;
pub mod manager;
pub mod store;

pub use key::cache_key;
pub use manager::{CacheError, CacheManager, CachePolicy, Fetched, WarmReport, WarmSource};
pub use store::{CacheEntry, CacheStats, CacheStore, MemoryStore};
