// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for query-cache.
//!
//! Every field except `lock_fallback` has a default. The fallback decides
//! whether callers that lose the computation lock wait for the winner or
//! compute on their own, and must always be chosen explicitly.
//!
//! # Example
//!
//! ```
//! use query_cache::{LockFallback, QueryCacheConfig};
//! use std::time::Duration;
//!
//! let config: QueryCacheConfig = serde_json::from_str(r#"{
//!     "redis_url": "redis://localhost:6379",
//!     "default_ttl_secs": 300,
//!     "lock_fallback": { "policy": "wait_for_peer", "poll_interval": 50, "max_wait": 5000 }
//! }"#).unwrap();
//!
//! assert_eq!(config.key_prefix, "qc");
//! assert_eq!(config.lock_config().lease, Duration::from_millis(30_000));
//!
//! // A fallback is required
//! assert!(serde_json::from_str::<QueryCacheConfig>("{}").is_err());
//!
//! let local = QueryCacheConfig::new(LockFallback::ComputeAnyway);
//! assert!(local.redis_url.is_none());
//! ```

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ResultCache, Ttl};
use crate::lock::{DistributedLock, LockConfig};
use crate::memo::{LockFallback, MemoConfig, Memoizer};
use crate::resilience::retry::RetryConfig;
use crate::serialization::SerializationLayer;
use crate::storage::memory::InMemoryStore;
use crate::storage::redis::RedisStore;
use crate::storage::traits::{KvStore, StorageError};

#[derive(Debug, Clone, Deserialize)]
pub struct QueryCacheConfig {
    /// Redis connection string (e.g., "redis://localhost:6379").
    /// `None` keeps everything in process.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every Redis key
    #[serde(default)]
    pub redis_namespace: Option<String>,

    /// First segment of memoization and search keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Default entry lifetime (0 = never expires)
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Lock settings
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    #[serde(default = "default_lock_acquire_timeout_ms")]
    pub lock_acquire_timeout_ms: u64,
    #[serde(default = "default_lock_backoff_initial_ms")]
    pub lock_backoff_initial_ms: u64,
    #[serde(default = "default_lock_backoff_max_ms")]
    pub lock_backoff_max_ms: u64,

    /// What to do when the computation lock cannot be acquired in time
    pub lock_fallback: LockFallback,

    /// Keys requested per SCAN round trip during pattern invalidation
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,

    /// Payloads at least this large are zstd-compressed when the
    /// `compression` feature is enabled (None = never)
    #[serde(default)]
    pub compression_threshold_bytes: Option<usize>,
}

fn default_key_prefix() -> String { "qc".to_string() }
fn default_ttl_secs() -> u64 { 3600 }
fn default_lock_lease_ms() -> u64 { 30_000 }
fn default_lock_acquire_timeout_ms() -> u64 { 10_000 }
fn default_lock_backoff_initial_ms() -> u64 { 10 }
fn default_lock_backoff_max_ms() -> u64 { 500 }
fn default_scan_batch_size() -> usize { 500 }

impl QueryCacheConfig {
    /// Defaults for everything but the fallback.
    #[must_use]
    pub fn new(lock_fallback: LockFallback) -> Self {
        Self {
            redis_url: None,
            redis_namespace: None,
            key_prefix: default_key_prefix(),
            default_ttl_secs: default_ttl_secs(),
            lock_lease_ms: default_lock_lease_ms(),
            lock_acquire_timeout_ms: default_lock_acquire_timeout_ms(),
            lock_backoff_initial_ms: default_lock_backoff_initial_ms(),
            lock_backoff_max_ms: default_lock_backoff_max_ms(),
            lock_fallback,
            scan_batch_size: default_scan_batch_size(),
            compression_threshold_bytes: None,
        }
    }

    #[must_use]
    pub fn default_ttl(&self) -> Ttl {
        Ttl::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            lease: Duration::from_millis(self.lock_lease_ms),
            acquire_timeout: Duration::from_millis(self.lock_acquire_timeout_ms),
            backoff_initial: Duration::from_millis(self.lock_backoff_initial_ms),
            backoff_max: Duration::from_millis(self.lock_backoff_max_ms),
            store_retry: RetryConfig::query(),
        }
    }

    #[must_use]
    pub fn memo_config(&self) -> MemoConfig {
        MemoConfig::new(self.lock_fallback)
            .with_key_prefix(self.key_prefix.clone())
            .with_lease(Duration::from_millis(self.lock_lease_ms))
            .with_acquire_timeout(Duration::from_millis(self.lock_acquire_timeout_ms))
    }

    #[must_use]
    pub fn serialization_layer(&self) -> SerializationLayer {
        SerializationLayer::new().with_compression_threshold(self.compression_threshold_bytes)
    }

    /// Redis when `redis_url` is set, otherwise an in-process store.
    pub async fn connect_store(&self) -> Result<Arc<dyn KvStore>, StorageError> {
        match &self.redis_url {
            Some(url) => {
                let store = RedisStore::with_prefix(url, self.redis_namespace.as_deref()).await?;
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(InMemoryStore::new())),
        }
    }

    /// Wire a cache, lock and memoizer over `store`.
    pub fn build(&self, store: Arc<dyn KvStore>) -> Memoizer {
        let cache = ResultCache::new(store.clone())
            .with_serializer(self.serialization_layer())
            .with_scan_batch_size(self.scan_batch_size);
        let lock = DistributedLock::with_config(store, self.lock_config());
        Memoizer::new(Arc::new(cache), lock, self.memo_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: QueryCacheConfig =
            serde_json::from_str(r#"{"lock_fallback":{"policy":"compute_anyway"}}"#).unwrap();

        assert_eq!(config.redis_url, None);
        assert_eq!(config.key_prefix, "qc");
        assert_eq!(config.default_ttl(), Ttl::After(Duration::from_secs(3600)));
        assert_eq!(config.scan_batch_size, 500);
        assert_eq!(config.lock_fallback, LockFallback::ComputeAnyway);
    }

    #[test]
    fn test_fallback_is_required() {
        let err = serde_json::from_str::<QueryCacheConfig>(r#"{"key_prefix":"x"}"#).unwrap_err();
        assert!(err.to_string().contains("lock_fallback"));
    }

    #[test]
    fn test_zero_ttl_means_never() {
        let mut config = QueryCacheConfig::new(LockFallback::ComputeAnyway);
        config.default_ttl_secs = 0;
        assert_eq!(config.default_ttl(), Ttl::Never);
    }

    #[test]
    fn test_conversions() {
        let config: QueryCacheConfig = serde_json::from_str(
            r#"{
                "key_prefix": "app",
                "lock_lease_ms": 2000,
                "lock_acquire_timeout_ms": 250,
                "lock_backoff_initial_ms": 5,
                "lock_backoff_max_ms": 40,
                "lock_fallback": {"policy":"wait_for_peer","poll_interval":10,"max_wait":1000}
            }"#,
        )
        .unwrap();

        let lock = config.lock_config();
        assert_eq!(lock.lease, Duration::from_secs(2));
        assert_eq!(lock.acquire_timeout, Duration::from_millis(250));
        assert_eq!(lock.backoff_for_attempt(10), Duration::from_millis(40));

        let memo = config.memo_config();
        assert_eq!(memo.key_prefix, "app");
        assert_eq!(memo.lease, Duration::from_secs(2));
        assert!(matches!(memo.fallback, LockFallback::WaitForPeer { .. }));
    }

    #[tokio::test]
    async fn test_in_process_store_without_redis_url() {
        let config = QueryCacheConfig::new(LockFallback::ComputeAnyway);
        let store = config.connect_store().await.unwrap();
        store.set("k", b"v", None).await.unwrap();

        let memo = config.build(store);
        let f = memo.wrap("id", |n: u8| async move { Ok::<_, String>(n) }, config.default_ttl());
        assert_eq!(f.call(4).await.unwrap(), 4);
    }
}
