// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Query Cache
//!
//! A result cache with single-flight memoization, lease locks and hybrid
//! search score fusion, over a shared key-value store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Memoizer / HybridSearch                   │
//! │  • Memoized::call(): cache → lock → compute → set → release │
//! │  • HybridSearch::search(): strategies → fuse → cache        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!            ┌─────────────────┴──────────────────┐
//!            ▼                                    ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │         ResultCache          │  │     DistributedLock      │
//! │  • TTL, tags, glob patterns  │  │  • SET NX PX lease       │
//! │  • fail-open reads, stats    │  │  • token compare-delete  │
//! └──────────────────────────────┘  └──────────────────────────┘
//!            │                                    │
//!            └─────────────────┬──────────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     KvStore (the seam)                      │
//! │  • InMemoryStore: DashMap, lazy expiry                      │
//! │  • RedisStore: ConnectionManager, Lua compare-and-*, SCAN   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use query_cache::{LockFallback, QueryCacheConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = QueryCacheConfig::new(LockFallback::WaitForPeer {
//!     poll_interval: Duration::from_millis(20),
//!     max_wait: Duration::from_secs(5),
//! });
//! let memo = config.build(config.connect_store().await.unwrap());
//!
//! let lookup = memo.wrap(
//!     "course_lookup",
//!     |id: u64| async move { Ok::<_, String>(format!("course {}", id)) },
//!     config.default_ttl(),
//! );
//!
//! assert_eq!(lookup.call(7).await.unwrap(), "course 7");
//! assert_eq!(lookup.call(7).await.unwrap(), "course 7"); // served from cache
//! assert_eq!(memo.cache().stats().hits, 1);
//! # }
//! ```
//!
//! ## Key namespaces
//!
//! Keys beginning with `__` are internal: locks live under `__lock:` and
//! tag indexes under `__tags:`. The cache refuses to write or delete such
//! keys and pattern invalidation never matches them.
//!
//! ## Modules
//!
//! - [`key_codec`]: deterministic cache keys from call arguments
//! - [`serialization`]: JSON payloads, optional zstd ([`compression`])
//! - [`storage`]: the [`KvStore`] seam and its adapters
//! - [`lock`]: lease-based distributed lock
//! - [`cache`]: the result cache
//! - [`memo`]: single-flight memoization
//! - [`search`]: score fusion and the hybrid search driver
//! - [`resilience`]: retry and circuit breaking

pub mod cache;
pub mod compression;
pub mod config;
pub mod key_codec;
pub mod lock;
pub mod memo;
pub mod metrics;
pub mod resilience;
pub mod search;
pub mod serialization;
pub mod storage;

/// Keys with this prefix belong to the crate, never to cached results
pub const RESERVED_KEY_PREFIX: &str = "__";
/// Prefix of lock records
pub const LOCK_KEY_PREFIX: &str = "__lock:";
/// Prefix of per-tag index sets
pub const TAG_INDEX_PREFIX: &str = "__tags:";

pub use cache::{CacheEntry, CacheError, CacheStats, CacheStatsSnapshot, ResultCache, Ttl};
pub use config::QueryCacheConfig;
pub use key_codec::{EncodingError, KeyArgs, KeyCodec};
pub use lock::{DistributedLock, LockConfig, LockError, LockGuard, LockRecord, LockToken};
pub use memo::{LockFallback, MemoConfig, MemoError, Memoized, Memoizer};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use search::{
    fuse, FusionMode, HybridSearch, SearchError, SearchHit, SearchRequest, SearchStrategy,
    StrategyError, StrategyHit, StrategyResults,
};
pub use serialization::{SerializationError, SerializationLayer};
pub use storage::memory::InMemoryStore;
pub use storage::redis::RedisStore;
pub use storage::traits::{KvStore, StorageError};
pub use metrics::LatencyTimer;
