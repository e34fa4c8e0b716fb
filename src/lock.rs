// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lease-based distributed lock over the shared [`KvStore`].
//!
//! A lock is a single key holding the owner's token, created with an
//! atomic set-if-absent that carries the lease as its expiry. Release and
//! renew are atomic compare-token operations, so a holder whose lease has
//! lapsed can never delete or extend a lock now owned by someone else.
//!
//! ```text
//! acquire:  SET key token NX PX lease   (retried with capped backoff until the deadline)
//! release:  if GET key == token then DEL key
//! renew:    if GET key == token then PEXPIRE key new_lease
//! ```
//!
//! The lease is the backstop for crashed holders: nothing else ever
//! removes a lock that was not released.
//!
//! Store failures are retried through [`RetryConfig`] and then reported as
//! [`LockError::Unavailable`]. An unreachable store is never treated as a
//! successful acquire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{KvStore, StorageError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock '{key}'")]
    TimedOut { key: String, waited: Duration },

    #[error("lock '{key}' is not held by this token")]
    NotOwner { key: String },

    #[error("lock store unavailable for '{key}': {source}")]
    Unavailable {
        key: String,
        #[source]
        source: StorageError,
    },
}

/// Opaque owner token. A fresh one is generated for every acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current state of a held lock, as seen by [`DistributedLock::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub lock_key: String,
    pub owner: LockToken,
    /// `None` only if something outside this crate wrote the key without expiry
    pub lease_remaining: Option<Duration>,
    pub lease_expires_at: Option<SystemTime>,
}

impl LockRecord {
    #[must_use]
    pub fn is_owned_by(&self, token: &LockToken) -> bool {
        &self.owner == token
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease used by [`DistributedLock::lock`]
    pub lease: Duration,
    /// Acquire timeout used by [`DistributedLock::lock`]
    pub acquire_timeout: Duration,
    /// First sleep between contended attempts
    pub backoff_initial: Duration,
    /// Upper bound on the sleep between attempts
    pub backoff_max: Duration,
    /// Retry policy for individual store commands
    pub store_retry: RetryConfig,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(500),
            store_retry: RetryConfig::query(),
        }
    }
}

impl LockConfig {
    /// Sleep after the `attempt`-th contended attempt (1-indexed).
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        RetryConfig {
            initial_delay: self.backoff_initial,
            max_delay: self.backoff_max,
            factor: 2.0,
            max_retries: None,
        }
        .delay_for_attempt(attempt)
    }
}

/// Handle to the lock namespace of one store. Cheap to clone.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    pub fn with_config(store: Arc<dyn KvStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire with the configured lease and timeout.
    pub async fn lock(&self, lock_key: &str) -> Result<LockGuard, LockError> {
        self.acquire(lock_key, self.config.lease, self.config.acquire_timeout)
            .await
    }

    /// Acquire `lock_key`, retrying with capped exponential backoff until
    /// `acquire_timeout` has elapsed. A zero timeout makes exactly one attempt.
    ///
    /// Sleeps never overshoot the deadline.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        lock_key: &str,
        lease: Duration,
        acquire_timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let deadline = started + acquire_timeout;
        let token = LockToken::generate();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            match self.attempt(lock_key, &token, lease).await {
                Ok(true) => {
                    crate::metrics::record_lock("acquired");
                    crate::metrics::record_lock_wait(started.elapsed());
                    debug!(key = %lock_key, attempts = attempt, "Lock acquired");
                    return Ok(self.guard(lock_key, token));
                }
                Ok(false) => {}
                Err(e) => {
                    crate::metrics::record_lock("unavailable");
                    return Err(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                crate::metrics::record_lock("timed_out");
                crate::metrics::record_lock_wait(started.elapsed());
                debug!(key = %lock_key, attempts = attempt, "Lock acquire timed out");
                return Err(LockError::TimedOut {
                    key: lock_key.to_string(),
                    waited: now.duration_since(started),
                });
            }

            let pause = self.config.backoff_for_attempt(attempt).min(deadline - now);
            sleep(pause).await;
        }
    }

    /// Single non-blocking attempt. `Ok(None)` when someone else holds it.
    #[instrument(skip(self))]
    pub async fn try_acquire(&self, lock_key: &str, lease: Duration) -> Result<Option<LockGuard>, LockError> {
        let token = LockToken::generate();
        match self.attempt(lock_key, &token, lease).await {
            Ok(true) => {
                crate::metrics::record_lock("acquired");
                Ok(Some(self.guard(lock_key, token)))
            }
            Ok(false) => Ok(None),
            Err(e) => {
                crate::metrics::record_lock("unavailable");
                Err(e)
            }
        }
    }

    /// Delete the lock only if `token` still owns it.
    #[instrument(skip(self, token))]
    pub async fn release(&self, lock_key: &str, token: &LockToken) -> Result<(), LockError> {
        let store = &self.store;
        let removed = retry("lock.release", &self.config.store_retry, || {
            let store = store.clone();
            async move { store.compare_and_delete(lock_key, token.as_bytes()).await }
        })
        .await
        .map_err(|source| unavailable(lock_key, source))?;

        if removed {
            crate::metrics::record_lock("released");
            debug!(key = %lock_key, "Lock released");
            Ok(())
        } else {
            crate::metrics::record_lock("not_owner");
            warn!(key = %lock_key, "Release by non-owner ignored (lease lapsed or lock taken over)");
            Err(LockError::NotOwner {
                key: lock_key.to_string(),
            })
        }
    }

    /// Reset the lease to `new_lease` only if `token` still owns the lock.
    #[instrument(skip(self, token))]
    pub async fn renew(&self, lock_key: &str, token: &LockToken, new_lease: Duration) -> Result<(), LockError> {
        let store = &self.store;
        let extended = retry("lock.renew", &self.config.store_retry, || {
            let store = store.clone();
            async move {
                store
                    .compare_and_expire(lock_key, token.as_bytes(), new_lease)
                    .await
            }
        })
        .await
        .map_err(|source| unavailable(lock_key, source))?;

        if extended {
            crate::metrics::record_lock("renewed");
            Ok(())
        } else {
            crate::metrics::record_lock("not_owner");
            warn!(key = %lock_key, "Renew by non-owner rejected");
            Err(LockError::NotOwner {
                key: lock_key.to_string(),
            })
        }
    }

    /// Who holds `lock_key` right now, and for how much longer.
    #[instrument(skip(self))]
    pub async fn inspect(&self, lock_key: &str) -> Result<Option<LockRecord>, LockError> {
        let store = &self.store;
        let owner = retry("lock.inspect", &self.config.store_retry, || {
            let store = store.clone();
            async move { store.get(lock_key).await }
        })
        .await
        .map_err(|source| unavailable(lock_key, source))?;

        let Some(owner) = owner else {
            return Ok(None);
        };
        let owner = String::from_utf8(owner).map_err(|e| {
            unavailable(
                lock_key,
                StorageError::Corruption {
                    key: lock_key.to_string(),
                    reason: e.to_string(),
                },
            )
        })?;

        let remaining = retry("lock.inspect_ttl", &self.config.store_retry, || {
            let store = store.clone();
            async move { store.ttl(lock_key).await }
        })
        .await
        .map_err(|source| unavailable(lock_key, source))?;

        // Lock vanished between the two reads
        let Some(lease_remaining) = remaining else {
            return Ok(None);
        };

        Ok(Some(LockRecord {
            lock_key: lock_key.to_string(),
            owner: LockToken(owner),
            lease_remaining,
            lease_expires_at: lease_remaining.map(|d| SystemTime::now() + d),
        }))
    }

    /// One logical set-if-absent, retried on store errors.
    ///
    /// A failed call may still have written the record (reply lost after
    /// the server applied it), so once any try has failed a `false` is
    /// checked against the stored owner: our own token means we hold it.
    /// If every try fails, a best-effort token-checked delete removes any
    /// record we may have left behind.
    async fn attempt(&self, lock_key: &str, token: &LockToken, lease: Duration) -> Result<bool, LockError> {
        let store = &self.store;
        let uncertain = AtomicBool::new(false);

        let result = retry("lock.acquire", &self.config.store_retry, || {
            let store = store.clone();
            let uncertain = &uncertain;
            async move {
                let outcome =
                    set_or_recognise(store.as_ref(), lock_key, token, lease, uncertain.load(Ordering::SeqCst))
                        .await;
                if outcome.is_err() {
                    uncertain.store(true, Ordering::SeqCst);
                }
                outcome
            }
        })
        .await;

        match result {
            Ok(acquired) => Ok(acquired),
            Err(source) => {
                if uncertain.load(Ordering::SeqCst) {
                    if let Ok(true) = store.compare_and_delete(lock_key, token.as_bytes()).await {
                        debug!(key = %lock_key, "Removed lock record left by a failed acquire");
                    }
                }
                Err(unavailable(lock_key, source))
            }
        }
    }

    fn guard(&self, lock_key: &str, token: LockToken) -> LockGuard {
        LockGuard {
            lock: self.clone(),
            key: lock_key.to_string(),
            token,
            released: false,
        }
    }
}

async fn set_or_recognise(
    store: &dyn KvStore,
    lock_key: &str,
    token: &LockToken,
    lease: Duration,
    after_failure: bool,
) -> Result<bool, StorageError> {
    if store.set_if_absent(lock_key, token.as_bytes(), lease).await? {
        return Ok(true);
    }
    if !after_failure {
        return Ok(false);
    }
    let owner = store.get(lock_key).await?;
    Ok(owner.as_deref() == Some(token.as_bytes()))
}

fn unavailable(key: &str, source: StorageError) -> LockError {
    warn!(key = %key, error = %source, "Lock store unavailable");
    LockError::Unavailable {
        key: key.to_string(),
        source,
    }
}

/// Proof of a successful acquire.
///
/// Call [`release`](LockGuard::release) when the critical section ends. A
/// guard dropped without releasing (panic, cancelled future) spawns a
/// best-effort release on the current tokio runtime; if there is no
/// runtime the lock simply lapses with its lease.
#[must_use = "dropping the guard releases the lock in the background"]
pub struct LockGuard {
    lock: DistributedLock,
    key: String,
    token: LockToken,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release(&self.key, &self.token).await
    }

    pub async fn renew(&self, new_lease: Duration) -> Result<(), LockError> {
        self.lock.renew(&self.key, &self.token, new_lease).await
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "Lock guard dropped outside a runtime; lock will lapse with its lease");
            return;
        };

        let store = self.lock.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = self.token.clone();
        debug!(key = %key, "Lock guard dropped without release, releasing in background");
        handle.spawn(async move {
            match store.compare_and_delete(&key, token.as_bytes()).await {
                Ok(true) => crate::metrics::record_lock("released"),
                Ok(false) => {
                    warn!(key = %key, "Background release found the lock owned by someone else")
                }
                Err(e) => warn!(key = %key, error = %e, "Background release failed"),
            }
        });
    }
}
