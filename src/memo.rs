// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-flight memoization.
//!
//! A [`Memoized`] computation consults the [`ResultCache`] first and, on a
//! miss, takes the [`DistributedLock`] for that key before computing, so
//! concurrent identical calls (in this process or any other sharing the
//! store) run the computation at most once:
//!
//! ```text
//! call(args)
//!   key = derive(args)
//!   cache hit? ──────────────────────────────────────────▶ value
//!   acquire(lock_prefix + key)
//!     ├─ acquired ─▶ cache hit? ─▶ value
//!     │              compute ─▶ set ─▶ release ──────────▶ value
//!     ├─ timed out ─▶ LockFallback
//!     │   ├─ WaitForPeer: poll cache / try lock until max_wait
//!     │   └─ ComputeAnyway: compute, do not cache
//!     └─ unavailable ─────────────────────────────────────▶ MemoError::Lock
//! ```
//!
//! Under `ComputeAnyway` the at-most-once guarantee no longer holds for
//! callers that timed out.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

use crate::cache::{CacheError, ResultCache, Ttl};
use crate::key_codec::{EncodingError, KeyArgs, KeyCodec};
use crate::lock::{DistributedLock, LockError, LockGuard};
use crate::metrics::record_memo;
use crate::serialization::SerializationError;
use crate::LOCK_KEY_PREFIX;

/// What a caller does when it cannot get the computation lock in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LockFallback {
    /// Poll the cache for the peer's result every `poll_interval`. Each
    /// poll also makes one non-blocking lock attempt, so waiters take over
    /// if the holder's lease lapsed. Gives up after `max_wait`.
    WaitForPeer {
        #[serde(with = "millis")]
        poll_interval: Duration,
        #[serde(with = "millis")]
        max_wait: Duration,
    },
    /// Compute without the lock and without caching the result.
    ComputeAnyway,
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Memoization settings. The lock fallback has no default and must be
/// chosen explicitly.
#[derive(Debug, Clone)]
pub struct MemoConfig {
    pub key_prefix: String,
    pub lock_prefix: String,
    pub lease: Duration,
    pub acquire_timeout: Duration,
    pub fallback: LockFallback,
}

impl MemoConfig {
    #[must_use]
    pub fn new(fallback: LockFallback) -> Self {
        Self {
            key_prefix: "qc".to_string(),
            lock_prefix: LOCK_KEY_PREFIX.to_string(),
            lease: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            fallback,
        }
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoError<E> {
    #[error("computation failed: {0}")]
    Computation(E),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The computed value cannot be represented by the serialization layer
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("gave up after {waited:?} waiting for a peer to compute '{key}'")]
    ComputationTimeout { key: String, waited: Duration },

    #[error(transparent)]
    Cache(CacheError),
}

type KeyFn<A> = Arc<dyn Fn(&A) -> Result<String, EncodingError> + Send + Sync>;

/// Factory for memoized computations sharing one cache, lock and config.
#[derive(Clone)]
pub struct Memoizer {
    cache: Arc<ResultCache>,
    lock: DistributedLock,
    codec: KeyCodec,
    config: Arc<MemoConfig>,
}

impl Memoizer {
    pub fn new(cache: Arc<ResultCache>, lock: DistributedLock, config: MemoConfig) -> Self {
        Self {
            cache,
            lock,
            codec: KeyCodec::new(),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MemoConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Memoize `computation` with keys `{key_prefix}:{identity}:{digest(args)}`.
    ///
    /// Use a tuple for several arguments; element order is significant.
    pub fn wrap<A, T, E, F, Fut>(&self, identity: &str, computation: F, ttl: Ttl) -> Memoized<A, T, E, F>
    where
        A: Serialize,
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let codec = self.codec.clone();
        let prefix = self.config.key_prefix.clone();
        let id = identity.to_string();
        let key_fn: KeyFn<A> = Arc::new(move |args: &A| codec.build(&prefix, &id, &KeyArgs::single(args)?));
        self.memoized(identity, computation, key_fn, ttl)
    }

    /// Memoize `computation` with a caller-supplied key derivation.
    pub fn wrap_with_key<A, T, E, F, Fut, K>(&self, computation: F, key_fn: K, ttl: Ttl) -> Memoized<A, T, E, F>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        K: Fn(&A) -> Result<String, EncodingError> + Send + Sync + 'static,
    {
        self.memoized("custom", computation, Arc::new(key_fn), ttl)
    }

    fn memoized<A, T, E, F>(&self, identity: &str, computation: F, key_fn: KeyFn<A>, ttl: Ttl) -> Memoized<A, T, E, F> {
        Memoized {
            identity: identity.to_string(),
            computation,
            key_fn,
            ttl,
            tags: Vec::new(),
            memo: self.clone(),
            _marker: PhantomData,
        }
    }
}

/// A computation with caching and single-flight semantics attached.
pub struct Memoized<A, T, E, F> {
    identity: String,
    computation: F,
    key_fn: KeyFn<A>,
    ttl: Ttl,
    tags: Vec<String>,
    memo: Memoizer,
    _marker: PhantomData<fn(A) -> Result<T, E>>,
}

impl<A, T, E, F, Fut> Memoized<A, T, E, F>
where
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Serialize + DeserializeOwned,
{
    /// Tag every cached result, for [`ResultCache::invalidate_by_tag`].
    #[must_use]
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| (*t).to_string()).collect();
        self
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn key_for(&self, args: &A) -> Result<String, EncodingError> {
        (self.key_fn)(args)
    }

    /// Drop the cached result for `args`. Returns 1 if one was cached.
    pub async fn invalidate(&self, args: &A) -> Result<u64, MemoError<E>> {
        let key = self.key_for(args)?;
        self.memo.cache.delete(&key).await.map_err(MemoError::Cache)
    }

    #[instrument(skip(self, args), fields(identity = %self.identity))]
    pub async fn call(&self, args: A) -> Result<T, MemoError<E>> {
        let key = self.key_for(&args)?;

        if let Some(value) = self.memo.cache.get::<T>(&key).await {
            record_memo(&self.identity, "hit");
            return Ok(value);
        }

        let config = &self.memo.config;
        let lock_key = format!("{}{}", config.lock_prefix, key);
        match self
            .memo
            .lock
            .acquire(&lock_key, config.lease, config.acquire_timeout)
            .await
        {
            Ok(guard) => self.compute_locked(guard, &key, args).await,
            Err(LockError::TimedOut { .. }) => self.fall_back(&key, &lock_key, args).await,
            Err(e) => {
                record_memo(&self.identity, "error");
                Err(MemoError::Lock(e))
            }
        }
    }

    async fn compute_locked(&self, guard: LockGuard, key: &str, args: A) -> Result<T, MemoError<E>> {
        // A peer may have filled the entry between our miss and the acquire
        if let Some(value) = self.memo.cache.get::<T>(key).await {
            release(guard).await;
            record_memo(&self.identity, "peer_filled");
            return Ok(value);
        }

        let value = match (self.computation)(args).await {
            Ok(value) => value,
            Err(e) => {
                release(guard).await;
                record_memo(&self.identity, "error");
                return Err(MemoError::Computation(e));
            }
        };

        let stored = self.store(key, &value).await;
        release(guard).await;
        stored?;

        record_memo(&self.identity, "computed");
        Ok(value)
    }

    async fn store(&self, key: &str, value: &T) -> Result<(), MemoError<E>> {
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        match self.memo.cache.set(key, value, self.ttl, &tags).await {
            Ok(()) => Ok(()),
            Err(CacheError::Serialization(e)) => Err(MemoError::Serialization(e)),
            Err(e) => {
                warn!(key = %key, error = %e, "Memoized result computed but not cached");
                Ok(())
            }
        }
    }

    async fn fall_back(&self, key: &str, lock_key: &str, args: A) -> Result<T, MemoError<E>> {
        match self.memo.config.fallback {
            LockFallback::ComputeAnyway => {
                debug!(key = %key, "Lock timed out, computing without caching");
                let value = (self.computation)(args)
                    .await
                    .map_err(MemoError::Computation)?;
                record_memo(&self.identity, "computed_uncached");
                Ok(value)
            }
            LockFallback::WaitForPeer {
                poll_interval,
                max_wait,
            } => {
                debug!(key = %key, "Lock timed out, waiting for peer");
                let started = Instant::now();
                let deadline = started + max_wait;
                loop {
                    if let Some(value) = self.memo.cache.get::<T>(key).await {
                        record_memo(&self.identity, "peer_filled");
                        return Ok(value);
                    }

                    match self.memo.lock.try_acquire(lock_key, self.memo.config.lease).await {
                        Ok(Some(guard)) => return self.compute_locked(guard, key, args).await,
                        Ok(None) => {}
                        Err(e) => {
                            record_memo(&self.identity, "error");
                            return Err(MemoError::Lock(e));
                        }
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        record_memo(&self.identity, "timeout");
                        return Err(MemoError::ComputationTimeout {
                            key: key.to_string(),
                            waited: now.duration_since(started),
                        });
                    }
                    sleep(poll_interval.min(deadline - now)).await;
                }
            }
        }
    }
}

async fn release(guard: LockGuard) {
    // NotOwner is already logged by the lock; nothing else to do here
    if let Err(e) = guard.release().await {
        debug!(error = %e, "Memo lock release failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use crate::resilience::retry::RetryConfig;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::KvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memoizer(fallback: LockFallback) -> (Memoizer, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(ResultCache::new(store.clone()));
        let lock = DistributedLock::with_config(
            store.clone(),
            LockConfig {
                store_retry: RetryConfig::fast(),
                ..LockConfig::default()
            },
        );
        let config = MemoConfig::new(fallback)
            .with_key_prefix("test")
            .with_lease(Duration::from_secs(5))
            .with_acquire_timeout(Duration::from_millis(100));
        (Memoizer::new(cache, lock, config), store)
    }

    fn wait_for_peer() -> LockFallback {
        LockFallback::WaitForPeer {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let (memo, _) = memoizer(wait_for_peer());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let double = memo.wrap(
            "double",
            move |n: u32| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(n * 2)
                }
            },
            Ttl::Never,
        );

        assert_eq!(double.call(21).await.unwrap(), 42);
        assert_eq!(double.call(21).await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(double.call(5).await.unwrap(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached_and_release_the_lock() {
        let (memo, store) = memoizer(wait_for_peer());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let flaky = memo.wrap(
            "flaky",
            move |_: ()| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("first call fails")
                    } else {
                        Ok(7)
                    }
                }
            },
            Ttl::Never,
        );

        assert!(matches!(flaky.call(()).await, Err(MemoError::Computation("first call fails"))));
        let key = flaky.key_for(&()).unwrap();
        assert!(store.get(&format!("__lock:{}", key)).await.unwrap().is_none());

        assert_eq!(flaky.call(()).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compute_anyway_when_lock_is_held() {
        let (memo, _) = memoizer(LockFallback::ComputeAnyway);
        let f = memo.wrap("f", |n: u32| async move { Ok::<_, String>(n + 1) }, Ttl::Never);

        let key = f.key_for(&1).unwrap();
        let _held = memo
            .lock
            .acquire(&format!("__lock:{}", key), Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(f.call(1).await.unwrap(), 2);
        // Computed without the lock, so nothing may be cached
        assert!(memo.cache().get_entry(&key).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_peer_times_out() {
        let (memo, _) = memoizer(LockFallback::WaitForPeer {
            poll_interval: Duration::from_millis(20),
            max_wait: Duration::from_millis(200),
        });
        let f = memo.wrap("f", |n: u32| async move { Ok::<_, String>(n) }, Ttl::Never);

        let key = f.key_for(&1).unwrap();
        let _held = memo
            .lock
            .acquire(&format!("__lock:{}", key), Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        assert!(matches!(f.call(1).await, Err(MemoError::ComputationTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_takes_over_a_lapsed_lease() {
        let (memo, _) = memoizer(LockFallback::WaitForPeer {
            poll_interval: Duration::from_millis(50),
            max_wait: Duration::from_secs(5),
        });
        let f = memo.wrap("f", |n: u32| async move { Ok::<_, String>(n * 10) }, Ttl::Never);

        // A crashed peer: lock taken, never released, lease eventually lapses
        let key = f.key_for(&3).unwrap();
        let crashed = memo
            .lock
            .acquire(&format!("__lock:{}", key), Duration::from_millis(300), Duration::ZERO)
            .await
            .unwrap();
        std::mem::forget(crashed);

        assert_eq!(f.call(3).await.unwrap(), 30);
        assert!(memo.cache().get_entry(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_tags_and_invalidate() {
        let (memo, _) = memoizer(wait_for_peer());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let f = memo
            .wrap(
                "courses",
                move |q: String| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(vec![q])
                    }
                },
                Ttl::from_secs(60),
            )
            .with_tags(&["courses"]);

        f.call("rust".to_string()).await.unwrap();
        assert_eq!(f.invalidate(&"rust".to_string()).await.unwrap(), 1);
        f.call("rust".to_string()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(memo.cache().invalidate_by_tag("courses").await.unwrap(), 1);
        f.call("rust".to_string()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_custom_key_derivation() {
        let (memo, _) = memoizer(wait_for_peer());
        let f = memo.wrap_with_key(
            |id: u64| async move { Ok::<_, String>(format!("user-{}", id)) },
            |id: &u64| Ok(format!("users:{}", id)),
            Ttl::Never,
        );

        assert_eq!(f.call(9).await.unwrap(), "user-9");
        let entry = memo.cache().get_entry("users:9").await.unwrap();
        assert!(!entry.value.is_empty());
    }

    #[tokio::test]
    async fn test_unencodable_arguments() {
        let (memo, _) = memoizer(wait_for_peer());
        let f = memo.wrap(
            "f",
            |_: std::collections::HashMap<Vec<u8>, u8>| async move { Ok::<_, String>(1) },
            Ttl::Never,
        );

        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], 1u8);
        assert!(matches!(f.call(bad).await, Err(MemoError::Encoding(_))));
    }

    #[test]
    fn test_fallback_deserializes() {
        let wait: LockFallback =
            serde_json::from_str(r#"{"policy":"wait_for_peer","poll_interval":25,"max_wait":5000}"#).unwrap();
        assert_eq!(
            wait,
            LockFallback::WaitForPeer {
                poll_interval: Duration::from_millis(25),
                max_wait: Duration::from_secs(5),
            }
        );

        let anyway: LockFallback = serde_json::from_str(r#"{"policy":"compute_anyway"}"#).unwrap();
        assert_eq!(anyway, LockFallback::ComputeAnyway);
    }
}
