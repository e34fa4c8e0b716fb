// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis [`KvStore`] backend.
//!
//! Maps the store primitives onto single Redis commands or server-side Lua
//! scripts so that each one is atomic at the server:
//!
//! ```text
//! set_if_absent       SET key value NX PX ms
//! compare_and_delete  EVAL  if GET == token then DEL
//! compare_and_expire  EVAL  if GET == token then PEXPIRE
//! scan_match          SCAN cursor MATCH pattern COUNT n   (never KEYS)
//! set_add             EVAL  SADD, then PEXPIRE only ever lengthening (or PERSIST)
//! set_remove/members  SREM / SMEMBERS
//! ```
//!
//! Every command except `set_if_absent` goes through [`retry`] with the
//! query preset, so a blip in the connection is absorbed before surfacing
//! as [`StorageError`]. `set_if_absent` is tried once; retrying it is the
//! caller's job because only the caller knows what value it wrote.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, Script};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, instrument};

use super::traits::{KvStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

// ARGV[2] < 0 means the member never expires, so neither does the set
const SET_ADD_WITH_EXPIRY: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
local added = redis.call('SADD', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl < 0 then
    redis.call('PERSIST', KEYS[1])
elseif existed == 0 then
    redis.call('PEXPIRE', KEYS[1], ttl)
else
    local current = redis.call('PTTL', KEYS[1])
    if current >= 0 and current < ttl then
        redis.call('PEXPIRE', KEYS[1], ttl)
    end
end
return added
"#;

fn backend(e: redis::RedisError) -> StorageError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StorageError::Connection(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

/// Redis rejects `PX 0`, so sub-millisecond TTLs round up.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Escape glob metacharacters so a namespace prefix matches literally.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:user:1")
    prefix: String,
    retry: RetryConfig,
    compare_and_delete: Script,
    compare_and_expire: Script,
    set_add: Script,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// The prefix is prepended to all keys, enabling namespacing when
    /// sharing a Redis instance with other applications. Keys handed back
    /// by [`KvStore::scan_match`] have the prefix stripped again.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use query_cache::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be prefixed: "myapp:user:1", "myapp:__lock:user:1"
    /// let store = RedisStore::with_prefix("redis://localhost", Some("myapp:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        // Startup preset: fail fast on a bad URL instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Connection(e.to_string()))?;

        Ok(Self::from_connection(connection, prefix))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            retry: RetryConfig::query(),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
            set_add: Script::new(SET_ADD_WITH_EXPIRY),
        }
    }

    /// Override the per-command retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl KvStore for RedisStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_get", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let data: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(backend)
    }

    #[instrument(skip(self, value), fields(bytes = value.len()))]
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_set", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                match ttl {
                    Some(ttl) => {
                        let _: () = cmd("SET")
                            .arg(&key)
                            .arg(value)
                            .arg("PX")
                            .arg(ttl_millis(ttl))
                            .query_async(&mut conn)
                            .await?;
                    }
                    None => {
                        let _: () = conn.set(&key, value).await?;
                    }
                }
                Ok(())
            }
        })
        .await
        .map_err(backend)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_delete", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let removed: u64 = conn.del(&key).await?;
                Ok(removed > 0)
            }
        })
        .await
        .map_err(backend)
    }

    #[instrument(skip(self, value))]
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);

        // Single attempt: a retried SET NX cannot tell a lost reply from a
        // lost race, so the caller decides how to recover.
        let reply: Option<String> = cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        // Nil reply means the key already existed
        Ok(reply.is_some())
    }

    #[instrument(skip(self, expected))]
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let script = &self.compare_and_delete;

        retry("redis_compare_and_delete", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let removed: i64 = script.key(&key).arg(expected).invoke_async(&mut conn).await?;
                Ok(removed > 0)
            }
        })
        .await
        .map_err(backend)
    }

    #[instrument(skip(self, expected))]
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let script = &self.compare_and_expire;

        retry("redis_compare_and_expire", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let updated: i64 = script
                    .key(&key)
                    .arg(expected)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn)
                    .await?;
                Ok(updated > 0)
            }
        })
        .await
        .map_err(backend)
    }

    #[instrument(skip(self))]
    async fn ttl(&self, key: &str) -> Result<Option<Option<Duration>>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        let millis: i64 = retry("redis_pttl", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let millis: i64 = cmd("PTTL").arg(&key).query_async(&mut conn).await?;
                Ok(millis)
            }
        })
        .await
        .map_err(backend)?;

        // -2: missing, -1: no expiry
        Ok(match millis {
            -2 => None,
            m if m < 0 => Some(None),
            m => Some(Some(Duration::from_millis(m as u64))),
        })
    }

    #[instrument(skip(self))]
    async fn scan_match(&self, pattern: &str, batch_hint: usize) -> Result<Vec<String>, StorageError> {
        let full_pattern = format!("{}{}", escape_glob(&self.prefix), pattern);
        let count = batch_hint.max(1);
        let mut keys = BTreeSet::new();
        let mut cursor = 0u64;
        let mut round_trips = 0usize;

        // SCAN instead of KEYS so the server is never blocked on one call
        loop {
            let conn = self.connection.clone();
            let (next_cursor, batch): (u64, Vec<String>) = retry("redis_scan", &self.retry, || {
                let mut conn = conn.clone();
                let full_pattern = full_pattern.clone();
                async move {
                    cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&full_pattern)
                        .arg("COUNT")
                        .arg(count)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await
            .map_err(backend)?;

            // SCAN may return a key more than once
            keys.extend(batch.iter().map(|k| self.strip_prefix(k).to_string()));
            cursor = next_cursor;
            round_trips += 1;

            if cursor == 0 {
                break;
            }
        }

        debug!(pattern, matched = keys.len(), round_trips, "Scan complete");
        Ok(keys.into_iter().collect())
    }

    #[instrument(skip(self))]
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let script = &self.set_add;
        let ttl_arg: i64 = ttl.map_or(-1, |t| ttl_millis(t) as i64);

        retry("redis_sadd", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let added: i64 = script
                    .key(&key)
                    .arg(member)
                    .arg(ttl_arg)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(added > 0)
            }
        })
        .await
        .map_err(backend)
    }

    #[instrument(skip(self))]
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_srem", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let removed: u64 = conn.srem(&key, member).await?;
                Ok(removed > 0)
            }
        })
        .await
        .map_err(backend)
    }

    #[instrument(skip(self))]
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_smembers", &self.retry, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let members: Vec<String> = conn.smembers(&key).await?;
                Ok(members)
            }
        })
        .await
        .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_rounds_up_to_one() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("app:"), "app:");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn test_escaped_prefix_matches_literally() {
        use crate::storage::glob::glob_match;
        let pattern = format!("{}{}", escape_glob("ns*:"), "user:*");
        assert!(glob_match(&pattern, "ns*:user:1"));
        assert!(!glob_match(&pattern, "nsX:user:1"));
    }
}
