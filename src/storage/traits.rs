// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Connection to store failed: {0}")]
    Connection(String),
    #[error("Invalid stored value for '{key}': {reason}")]
    Corruption { key: String, reason: String },
}

/// Shared key-value store seam.
///
/// Every adapter (in-memory, Redis, test doubles) must honour the atomicity
/// of [`set_if_absent`](KvStore::set_if_absent),
/// [`compare_and_delete`](KvStore::compare_and_delete) and
/// [`compare_and_expire`](KvStore::compare_and_expire). Lock safety and the
/// single-flight guarantee depend on it.
///
/// Expired keys must be invisible to every read, including scans.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a value, replacing any previous one. `None` means no expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Returns true if a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Atomically create `key` with an expiry only if no live value exists.
    ///
    /// Implementations must not retry internally: after a lost reply a
    /// second try reports `false` for a write that did happen.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError>;

    /// Atomically delete `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError>;

    /// Atomically reset the expiry of `key` only if its value equals `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Remaining time to live. `Ok(None)` when the key is missing,
    /// `Ok(Some(None))` when it exists without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Option<Duration>>, StorageError>;

    /// Snapshot of live keys matching a glob pattern (`*`, `?`, `[...]`).
    /// `batch_hint` bounds the work done per store round trip.
    async fn scan_match(&self, pattern: &str, batch_hint: usize) -> Result<Vec<String>, StorageError>;

    /// Add a member to the set stored at `key`. Returns true if it was new.
    ///
    /// The set is kept alive at least `ttl` from now: an existing expiry is
    /// only ever lengthened, and `None` removes it.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<bool, StorageError>;

    /// Remove a member. Returns true if it was present. An emptied set is
    /// deleted.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError>;
}
