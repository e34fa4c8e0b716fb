// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`KvStore`] backed by a sharded `DashMap`.
//!
//! The atomic primitives are implemented with DashMap's entry API, which
//! holds only the shard lock of the key involved, so operations on
//! different keys never wait on each other. Expiry is lazy: an expired
//! value is invisible to every read and is removed by the first access
//! that notices it (or by [`InMemoryStore::purge_expired`]).
//!
//! Time comes from `tokio::time::Instant`, so tests running with a paused
//! clock can advance past TTLs and leases without sleeping.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

use super::glob::glob_match;
use super::traits::{KvStore, StorageError};

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn bytes(value: &[u8], ttl: Option<Duration>) -> Self {
        Self {
            value: StoredValue::Bytes(value.to_vec()),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    fn holds_bytes(&self, expected: &[u8]) -> bool {
        matches!(&self.value, StoredValue::Bytes(b) if b.as_slice() == expected)
    }
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::Backend(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

pub struct InMemoryStore {
    data: DashMap<String, StoredEntry>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Number of stored keys, including expired ones not yet purged
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.data.len())
    }

    /// Remove `key` if it has expired, so later reads see it as absent.
    fn evict_if_expired(&self, key: &str, now: Instant) {
        self.data.remove_if(key, |_, entry| !entry.is_live(now));
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        let found = match self.data.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                StoredValue::Bytes(bytes) => Some(bytes.clone()),
                StoredValue::Set(_) => return Err(wrong_type(key)),
            },
            Some(_) => None,
            None => return Ok(None),
        };
        if found.is_none() {
            self.evict_if_expired(key, now);
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), StoredEntry::bytes(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(StoredEntry::bytes(value, Some(ttl)));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::bytes(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        let now = Instant::now();
        Ok(self
            .data
            .remove_if(key, |_, entry| entry.is_live(now) && entry.holds_bytes(expected))
            .is_some())
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.holds_bytes(expected) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Option<Duration>>, StorageError> {
        let now = Instant::now();
        Ok(match self.data.get(key) {
            Some(entry) if entry.is_live(now) => {
                Some(entry.expires_at.map(|at| at.saturating_duration_since(now)))
            }
            _ => None,
        })
    }

    /// Walks the map shard by shard; `batch_hint` has no effect here.
    async fn scan_match(&self, pattern: &str, _batch_hint: usize) -> Result<Vec<String>, StorageError> {
        let now = Instant::now();
        let keys = self
            .data
            .iter()
            .filter(|entry| entry.value().is_live(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<bool, StorageError> {
        let now = Instant::now();
        let wanted = ttl.map(|t| now + t);
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                value: StoredValue::Set(BTreeSet::new()),
                expires_at: wanted,
            });
        if !entry.is_live(now) {
            *entry = StoredEntry {
                value: StoredValue::Set(BTreeSet::new()),
                expires_at: wanted,
            };
        }
        let StoredValue::Set(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let added = members.insert(member.to_string());
        // Only ever lengthen; a set without expiry stays that way
        entry.expires_at = match (entry.expires_at, wanted) {
            (Some(current), Some(wanted)) => Some(current.max(wanted)),
            _ => None,
        };
        Ok(added)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    return Ok(false);
                }
                let StoredValue::Set(members) = &mut occupied.get_mut().value else {
                    return Err(wrong_type(key));
                };
                let removed = members.remove(member);
                if members.is_empty() {
                    occupied.remove();
                }
                Ok(removed)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let now = Instant::now();
        match self.data.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                StoredValue::Set(members) => Ok(members.iter().cloned().collect()),
                StoredValue::Bytes(_) => Err(wrong_type(key)),
            },
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = InMemoryStore::new();
        store.set("k", b"1", None).await.unwrap();
        store.set("k", b"2", None).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let store = InMemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_value_is_invisible_and_evicted() {
        let store = InMemoryStore::new();
        store.set("k", b"v", Some(Duration::from_secs(1))).await.unwrap();

        tokio::time::advance(Duration::from_millis(1100)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.len(), 0);
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_respects_live_and_expired_values() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("lock", b"a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("lock", b"b", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_millis(1100)).await;

        assert!(store.set_if_absent("lock", b"b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_delete_only_for_matching_value() {
        let store = InMemoryStore::new();
        store.set_if_absent("lock", b"owner-a", Duration::from_secs(10)).await.unwrap();

        assert!(!store.compare_and_delete("lock", b"owner-b").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"owner-a".to_vec()));

        assert!(store.compare_and_delete("lock", b"owner-a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_expire_extends_lease() {
        let store = InMemoryStore::new();
        store.set_if_absent("lock", b"a", Duration::from_secs(1)).await.unwrap();

        assert!(!store.compare_and_expire("lock", b"b", Duration::from_secs(5)).await.unwrap());
        assert!(store.compare_and_expire("lock", b"a", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_ttl_reporting() {
        let store = InMemoryStore::new();
        store.set("forever", b"v", None).await.unwrap();
        store.set("short", b"v", Some(Duration::from_secs(30))).await.unwrap();

        assert_eq!(store.ttl("forever").await.unwrap(), Some(None));
        let remaining = store.ttl("short").await.unwrap().flatten().unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert_eq!(store.ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_match_returns_only_matching_live_keys() {
        let store = InMemoryStore::new();
        store.set("user:1", b"a", None).await.unwrap();
        store.set("user:2", b"b", None).await.unwrap();
        store.set("course:1", b"c", None).await.unwrap();

        let mut keys = store.scan_match("user:*", 100).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = InMemoryStore::new();
        assert!(store.set_add("tags", "a", None).await.unwrap());
        assert!(!store.set_add("tags", "a", None).await.unwrap());
        assert!(store.set_add("tags", "b", None).await.unwrap());
        assert_eq!(store.set_members("tags").await.unwrap(), vec!["a", "b"]);
        assert!(store.set_members("none").await.unwrap().is_empty());

        assert!(store.set_remove("tags", "a").await.unwrap());
        assert!(!store.set_remove("tags", "a").await.unwrap());
        assert!(!store.set_remove("none", "a").await.unwrap());
        assert_eq!(store.set_members("tags").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_emptied_set_is_deleted() {
        let store = InMemoryStore::new();
        store.set_add("tags", "a", None).await.unwrap();
        store.set_remove("tags", "a").await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.ttl("tags").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_expiry_only_lengthens() {
        let store = InMemoryStore::new();
        store.set_add("tags", "long", Some(Duration::from_secs(10))).await.unwrap();
        store.set_add("tags", "short", Some(Duration::from_secs(1))).await.unwrap();

        let remaining = store.ttl("tags").await.unwrap().flatten().unwrap();
        assert!(remaining > Duration::from_secs(9));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.set_members("tags").await.unwrap(), vec!["long", "short"]);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_members("tags").await.unwrap().is_empty());
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_without_expiry_pins_the_set() {
        let store = InMemoryStore::new();
        store.set_add("tags", "a", Some(Duration::from_secs(1))).await.unwrap();
        store.set_add("tags", "b", None).await.unwrap();
        store.set_add("tags", "c", Some(Duration::from_secs(1))).await.unwrap();

        assert_eq!(store.ttl("tags").await.unwrap(), Some(None));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.set_members("tags").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let store = InMemoryStore::new();
        store.set_add("tags", "a", None).await.unwrap();
        assert!(store.get("tags").await.is_err());

        store.set("bytes", b"v", None).await.unwrap();
        assert!(store.set_add("bytes", "a", None).await.is_err());
        assert!(store.set_remove("bytes", "a").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = InMemoryStore::new();
        store.set("a", b"1", Some(Duration::from_secs(1))).await.unwrap();
        store.set("b", b"2", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_set_if_absent_has_single_winner() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let token = format!("owner-{}", i);
                store
                    .set_if_absent("lock", token.as_bytes(), Duration::from_secs(10))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
