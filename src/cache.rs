// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Result cache over the shared [`KvStore`].
//!
//! # Entry format
//!
//! Each entry is a single store value framed as
//!
//! ```text
//! ┌──────────────┬────────────────────────────┬─────────────────────┐
//! │ u32 BE len N │ header JSON (N bytes)      │ payload             │
//! │              │ created_at_ms              │ SerializationLayer  │
//! │              │ expires_at_ms (null=never) │ output              │
//! │              │ tags                       │                     │
//! └──────────────┴────────────────────────────┴─────────────────────┘
//! ```
//!
//! The store expiry is set from the same TTL, so the store removes expired
//! entries on its own. The header expiry is checked on read as well, and an
//! entry found past it is deleted (only if unchanged since the read) and
//! reported as a miss.
//!
//! # Tags
//!
//! Tags live in the entry header and in one index set per tag under
//! `__tags:{tag}`. Tag invalidation only deletes members whose header
//! still carries the tag, so an entry overwritten without the tag is left
//! alone even if a stale index member still names it.
//!
//! Index members are kept close to the live entries:
//!
//! - each index expires no earlier than its longest-lived member
//! - delete, pattern invalidation and overwrites remove the member
//! - [`ResultCache::prune_tag_index`] drops members whose entry is gone,
//!   and runs for the written tags every [`DEFAULT_TAG_PRUNE_INTERVAL`]
//!   tagged writes
//!
//! # Failure policy
//!
//! Reads fail open: a store error, an open circuit or an undecodable entry
//! is a miss (and an error in the stats). Writes report failure to the
//! caller but callers such as the memoizer only log it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::metrics::{record_cache_op, record_invalidated, LatencyTimer};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::serialization::{SerializationError, SerializationLayer};
use crate::storage::traits::{KvStore, StorageError};
use crate::{RESERVED_KEY_PREFIX, TAG_INDEX_PREFIX};

/// Default number of keys requested per SCAN round trip
pub const DEFAULT_SCAN_BATCH: usize = 500;

/// Tagged writes between opportunistic prunes of the written tags' indexes
pub const DEFAULT_TAG_PRUNE_INTERVAL: u64 = 1024;

const FRAME_LEN_BYTES: usize = 4;

/// Entry lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Never,
    After(Duration),
}

impl Ttl {
    /// Seconds-based constructor where `0` means [`Ttl::Never`].
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Ttl::Never
        } else {
            Ttl::After(Duration::from_secs(secs))
        }
    }

    /// Expiry handed to the store. Sub-millisecond lifetimes round up to
    /// 1ms so an entry always expires strictly after it was created.
    #[must_use]
    pub fn store_ttl(&self) -> Option<Duration> {
        match self {
            Ttl::Never => None,
            Ttl::After(d) => Some(round_up_to_millis(*d)),
        }
    }
}

fn round_up_to_millis(d: Duration) -> Duration {
    let millis = d.as_nanos().div_ceil(1_000_000).max(1);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Store(#[from] StorageError),

    #[error("store circuit is open")]
    CircuitOpen,

    #[error("key '{0}' is in the reserved '__' namespace")]
    ReservedKey(String),
}

/// A decoded entry header plus its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    /// Payload as produced by the [`SerializationLayer`]
    pub value: Vec<u8>,
    pub created_at: SystemTime,
    /// `None` for [`Ttl::Never`]
    pub expires_at: Option<SystemTime>,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    created_at_ms: u64,
    expires_at_ms: Option<u64>,
    #[serde(default)]
    tags: BTreeSet<String>,
}

fn encode_frame(header: &EntryHeader, payload: &[u8]) -> Result<Vec<u8>, SerializationError> {
    let header = serde_json::to_vec(header).map_err(|e| SerializationError::Encode(e.to_string()))?;
    let len = u32::try_from(header.len())
        .map_err(|_| SerializationError::Encode("entry header exceeds 4 GiB".to_string()))?;

    let mut frame = Vec::with_capacity(FRAME_LEN_BYTES + header.len() + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn decode_frame(key: &str, frame: &[u8]) -> Result<CacheEntry, StorageError> {
    let corrupt = |reason: String| StorageError::Corruption {
        key: key.to_string(),
        reason,
    };

    let len_bytes: [u8; FRAME_LEN_BYTES] = frame
        .get(..FRAME_LEN_BYTES)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| corrupt("truncated entry frame".to_string()))?;
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    let header_end = FRAME_LEN_BYTES
        .checked_add(header_len)
        .filter(|end| *end <= frame.len())
        .ok_or_else(|| corrupt(format!("header length {} exceeds frame", header_len)))?;

    let header: EntryHeader = serde_json::from_slice(&frame[FRAME_LEN_BYTES..header_end])
        .map_err(|e| corrupt(format!("bad entry header: {}", e)))?;

    Ok(CacheEntry {
        key: key.to_string(),
        value: frame[header_end..].to_vec(),
        created_at: UNIX_EPOCH + Duration::from_millis(header.created_at_ms),
        expires_at: header
            .expires_at_ms
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms)),
        tags: header.tags,
    })
}

fn tag_index_key(tag: &str) -> String {
    format!("{}{}", TAG_INDEX_PREFIX, tag)
}

/// Tags named by a stored frame. An unreadable frame names none.
fn frame_tags(key: &str, frame: &[u8]) -> BTreeSet<String> {
    match decode_frame(key, frame) {
        Ok(entry) => entry.tags,
        Err(e) => {
            debug!(key = %key, error = %e, "Ignoring tags of undecodable entry");
            BTreeSet::new()
        }
    }
}

/// Per-instance counters. Share one `Arc<CacheStats>` between caches to
/// aggregate, or give each its own to observe them in isolation.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStatsSnapshot {
    /// Hits over lookups; 0.0 before any lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

pub struct ResultCache {
    store: Arc<dyn KvStore>,
    serializer: SerializationLayer,
    stats: Arc<CacheStats>,
    scan_batch: usize,
    breaker: Option<Arc<CircuitBreaker>>,
    tag_prune_interval: u64,
    tagged_writes: AtomicU64,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            serializer: SerializationLayer::default(),
            stats: Arc::new(CacheStats::new()),
            scan_batch: DEFAULT_SCAN_BATCH,
            breaker: None,
            tag_prune_interval: DEFAULT_TAG_PRUNE_INTERVAL,
            tagged_writes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_stats(mut self, stats: Arc<CacheStats>) -> Self {
        self.stats = stats;
        self
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: SerializationLayer) -> Self {
        self.serializer = serializer;
        self
    }

    #[must_use]
    pub fn with_scan_batch_size(mut self, batch: usize) -> Self {
        self.scan_batch = batch.max(1);
        self
    }

    /// Prune the written tags' indexes every `interval` tagged writes.
    /// `0` disables opportunistic pruning.
    #[must_use]
    pub fn with_tag_prune_interval(mut self, interval: u64) -> Self {
        self.tag_prune_interval = interval;
        self
    }

    /// Route every store call through `breaker`.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    #[must_use]
    pub fn stats_handle(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        match &self.breaker {
            None => op().await.map_err(CacheError::Store),
            Some(breaker) => breaker.call(op).await.map_err(|e| match e {
                CircuitError::Rejected => CacheError::CircuitOpen,
                CircuitError::Inner(e) => CacheError::Store(e),
            }),
        }
    }

    /// Read and unframe an entry, removing it if its header says it expired.
    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(frame) = self.guarded(|| self.store.get(key)).await? else {
            return Ok(None);
        };
        let entry = decode_frame(key, &frame)?;

        if entry.is_expired_at(SystemTime::now()) {
            debug!(key = %key, "Lazily removing expired entry");
            // A concurrent rewrite replaced the frame we saw; leave it alone
            if let Err(e) = self.guarded(|| self.store.compare_and_delete(key, &frame)).await {
                debug!(key = %key, error = %e, "Failed to remove expired entry");
            }
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Cached value for `key`, or `None` on miss.
    ///
    /// Never fails: store errors, an open circuit and undecodable entries
    /// are all reported as a miss and counted as errors.
    #[instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let _timer = LatencyTimer::new("get");

        let entry = match self.read_entry(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.stats.miss();
                record_cache_op("get", "miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                self.stats.miss();
                self.stats.error();
                record_cache_op("get", "error");
                return None;
            }
        };

        match self.serializer.decode(&entry.value) {
            Ok(value) => {
                self.stats.hit();
                record_cache_op("get", "hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cached entry could not be decoded, treating as miss");
                self.stats.miss();
                self.stats.error();
                record_cache_op("get", "error");
                None
            }
        }
    }

    /// Raw entry for inspection. Does not touch the stats.
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        match self.read_entry(key).await {
            Ok(entry) => entry,
            Err(e) => {
                debug!(key = %key, error = %e, "Entry inspection failed");
                None
            }
        }
    }

    /// Store `value` under `key`, replacing any previous entry and its tags.
    ///
    /// Tag index updates are written before the entry itself so an entry
    /// that exists is always reachable from its tags.
    #[instrument(skip(self, value))]
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Ttl,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let _timer = LatencyTimer::new("set");

        if key.starts_with(RESERVED_KEY_PREFIX) {
            return Err(CacheError::ReservedKey(key.to_string()));
        }

        let frame = match self.frame(value, ttl, tags) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(key = %key, error = %e, "Value could not be serialized, not caching");
                self.stats.error();
                record_cache_op("set", "error");
                return Err(CacheError::Serialization(e));
            }
        };

        match self.write(key, &frame, ttl, tags).await {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
                record_cache_op("set", "success");
                self.maybe_prune(tags).await;
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache write failed");
                self.stats.error();
                record_cache_op("set", "error");
                Err(e)
            }
        }
    }

    fn frame<T: Serialize + ?Sized>(&self, value: &T, ttl: Ttl, tags: &[&str]) -> Result<Vec<u8>, SerializationError> {
        let payload = self.serializer.encode(value)?;
        let now = SystemTime::now();
        let header = EntryHeader {
            created_at_ms: unix_millis(now),
            expires_at_ms: ttl.store_ttl().map(|d| unix_millis(now + d)),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        };
        encode_frame(&header, &payload)
    }

    async fn write(&self, key: &str, frame: &[u8], ttl: Ttl, tags: &[&str]) -> Result<(), CacheError> {
        let previous = match self.guarded(|| self.store.get(key)).await? {
            Some(old) => frame_tags(key, &old),
            None => BTreeSet::new(),
        };

        for tag in tags {
            let index = tag_index_key(tag);
            self.guarded(|| self.store.set_add(&index, key, ttl.store_ttl()))
                .await?;
        }
        self.guarded(|| self.store.set(key, frame, ttl.store_ttl()))
            .await?;

        // The entry is written; a stale member left here only costs a prune
        for dropped in previous.iter().filter(|t| !tags.contains(&t.as_str())) {
            let index = tag_index_key(dropped);
            if let Err(e) = self.guarded(|| self.store.set_remove(&index, key)).await {
                debug!(key = %key, tag = %dropped, error = %e, "Failed to untag overwritten entry");
            }
        }
        Ok(())
    }

    async fn maybe_prune(&self, tags: &[&str]) {
        if tags.is_empty() || self.tag_prune_interval == 0 {
            return;
        }
        let written = self.tagged_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if written % self.tag_prune_interval != 0 {
            return;
        }
        for tag in tags {
            if let Err(e) = self.prune_tag_index(tag).await {
                debug!(tag = %tag, error = %e, "Opportunistic tag prune failed");
            }
        }
    }

    /// Delete the entry at `key` after removing it from its tag indexes.
    ///
    /// Untagging comes first so a failure leaves the entry reachable.
    async fn remove_entry(&self, key: &str) -> Result<bool, CacheError> {
        let Some(frame) = self.guarded(|| self.store.get(key)).await? else {
            return Ok(false);
        };
        for tag in frame_tags(key, &frame) {
            let index = tag_index_key(&tag);
            self.guarded(|| self.store.set_remove(&index, key)).await?;
        }
        self.guarded(|| self.store.delete(key)).await
    }

    /// Remove one entry. Returns 1 if it existed, 0 otherwise.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        let _timer = LatencyTimer::new("delete");

        if key.starts_with(RESERVED_KEY_PREFIX) {
            return Err(CacheError::ReservedKey(key.to_string()));
        }

        match self.remove_entry(key).await {
            Ok(removed) => {
                let n = u64::from(removed);
                self.stats.deletes.fetch_add(n, Ordering::Relaxed);
                record_cache_op("delete", "success");
                record_invalidated("delete", n);
                Ok(n)
            }
            Err(e) => {
                self.stats.error();
                record_cache_op("delete", "error");
                Err(e)
            }
        }
    }

    /// Delete every entry whose key matches `pattern` (glob syntax).
    ///
    /// Works from a snapshot of matching keys taken by an incremental scan:
    /// entries created after the scan are not affected. Internal keys
    /// (locks, tag indexes) are never matched.
    #[instrument(skip(self))]
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let _timer = LatencyTimer::new("invalidate_pattern");

        let keys = match self.guarded(|| self.store.scan_match(pattern, self.scan_batch)).await {
            Ok(keys) => keys,
            Err(e) => {
                self.stats.error();
                record_cache_op("invalidate_pattern", "error");
                return Err(e);
            }
        };

        let targets = keys
            .iter()
            .map(String::as_str)
            .filter(|k| !k.starts_with(RESERVED_KEY_PREFIX));
        let removed = self.delete_each(targets, "invalidate_pattern").await?;

        debug!(pattern = %pattern, scanned = keys.len(), removed, "Pattern invalidation complete");
        Ok(removed)
    }

    /// Delete every entry currently tagged with `tag` and drop the tag index.
    #[instrument(skip(self))]
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<u64, CacheError> {
        let _timer = LatencyTimer::new("invalidate_tag");
        let index = tag_index_key(tag);

        let members = match self.guarded(|| self.store.set_members(&index)).await {
            Ok(members) => members,
            Err(e) => {
                self.stats.error();
                record_cache_op("invalidate_tag", "error");
                return Err(e);
            }
        };
        // Drop the index first: a set racing with us re-creates it and survives
        if let Err(e) = self.guarded(|| self.store.delete(&index)).await {
            self.stats.error();
            record_cache_op("invalidate_tag", "error");
            return Err(e);
        }

        let mut still_tagged = Vec::with_capacity(members.len());
        for member in &members {
            match self.read_entry(member).await {
                Ok(Some(entry)) if entry.has_tag(tag) => still_tagged.push(member.as_str()),
                Ok(_) => {}
                Err(CacheError::Store(StorageError::Corruption { .. })) => {
                    still_tagged.push(member.as_str())
                }
                Err(e) => {
                    self.stats.error();
                    record_cache_op("invalidate_tag", "error");
                    return Err(e);
                }
            }
        }

        let removed = self.delete_each(still_tagged.into_iter(), "invalidate_tag").await?;
        debug!(tag = %tag, indexed = members.len(), removed, "Tag invalidation complete");
        Ok(removed)
    }

    async fn delete_each<'k>(
        &self,
        keys: impl Iterator<Item = &'k str>,
        operation: &'static str,
    ) -> Result<u64, CacheError> {
        let mut removed = 0u64;
        for key in keys {
            match self.remove_entry(key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    self.stats.deletes.fetch_add(removed, Ordering::Relaxed);
                    self.stats.error();
                    record_invalidated(operation, removed);
                    record_cache_op(operation, "error");
                    return Err(e);
                }
            }
        }
        self.stats.deletes.fetch_add(removed, Ordering::Relaxed);
        record_invalidated(operation, removed);
        record_cache_op(operation, "success");
        Ok(removed)
    }

    /// Drop members of `tag`'s index whose entry is gone or no longer
    /// carries the tag. Returns how many were dropped.
    ///
    /// A member re-written with the tag while the prune ran is put back.
    #[instrument(skip(self))]
    pub async fn prune_tag_index(&self, tag: &str) -> Result<u64, CacheError> {
        let index = tag_index_key(tag);
        let members = match self.guarded(|| self.store.set_members(&index)).await {
            Ok(members) => members,
            Err(e) => {
                self.stats.error();
                record_cache_op("prune_tags", "error");
                return Err(e);
            }
        };

        let mut pruned = 0u64;
        for member in &members {
            match self.prune_member(&index, tag, member).await {
                Ok(true) => pruned += 1,
                Ok(false) => {}
                Err(e) => {
                    self.stats.error();
                    record_cache_op("prune_tags", "error");
                    return Err(e);
                }
            }
        }

        record_cache_op("prune_tags", "success");
        debug!(tag = %tag, indexed = members.len(), pruned, "Tag index pruned");
        Ok(pruned)
    }

    async fn prune_member(&self, index: &str, tag: &str, member: &str) -> Result<bool, CacheError> {
        if self.still_tagged(tag, member).await? {
            return Ok(false);
        }
        if !self.guarded(|| self.store.set_remove(index, member)).await? {
            return Ok(false);
        }
        // Re-written between the check and the removal: restore the member
        if let Some(entry) = self.tagged_entry(tag, member).await? {
            let ttl = entry
                .expires_at
                .map(|at| round_up_to_millis(at.duration_since(SystemTime::now()).unwrap_or_default()));
            self.guarded(|| self.store.set_add(index, member, ttl)).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn still_tagged(&self, tag: &str, key: &str) -> Result<bool, CacheError> {
        match self.tagged_entry(tag, key).await {
            Ok(entry) => Ok(entry.is_some()),
            // Kept, as tag invalidation will still delete it
            Err(CacheError::Store(StorageError::Corruption { .. })) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn tagged_entry(&self, tag: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.read_entry(key).await?.filter(|entry| entry.has_tag(tag)))
    }
}
