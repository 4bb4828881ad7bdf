//! Cache backend implementations.

use crate::config::RedisConfig;
use crate::error::{DroverError, ErrorCode, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A TTL key-value cache with per-key atomicity.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value, replacing any existing one.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Set a value only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete a value. Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete `key` only while it still holds exactly `expected`, as one atomic step.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Append a member to the list stored at `key`, refreshing the list TTL.
    async fn push_back(&self, key: &str, member: &str, ttl: Duration) -> Result<()>;

    /// Remove and return the first member of the list stored at `key`.
    async fn pop_front(&self, key: &str) -> Result<Option<String>>;

    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Whether this backend discards everything (no shared cache configured).
    fn is_noop(&self) -> bool {
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// No-op Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Backend used when no shared cache is configured.
///
/// Writes succeed, reads miss, and `set_if_absent` always wins, so locking
/// degenerates to the job store's own claim semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

#[async_trait]
impl CacheBackend for NoopBackend {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn set_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn delete_if_eq(&self, _key: &str, _expected: &[u8]) -> Result<bool> {
        Ok(false)
    }

    async fn push_back(&self, _key: &str, _member: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn pop_front(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_noop(&self) -> bool {
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

enum StoredValue {
    Bytes(Vec<u8>),
    List(VecDeque<String>),
}

struct InMemoryEntry {
    value: StoredValue,
    expires_at: Instant,
}

impl InMemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Process-local TTL cache.
///
/// Cloning shares nothing; wrap it in an `Arc` to share one cache between
/// several queue managers (e.g. to simulate multiple instances in tests).
#[derive(Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, InMemoryEntry>,
}

impl InMemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove expired entries.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                StoredValue::Bytes(bytes) => Ok(Some(bytes.clone())),
                StoredValue::List(_) => Err(DroverError::new(
                    ErrorCode::CacheError,
                    format!("Key {} holds a list", key),
                )),
            },
            Some(entry) => {
                drop(entry);
                self.entries.remove_if(key, |_, e| e.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            InMemoryEntry {
                value: StoredValue::Bytes(value.to_vec()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = InMemoryEntry {
            value: StoredValue::Bytes(value.to_vec()),
            expires_at: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| !entry.is_expired(now))
            .unwrap_or(false))
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, entry| match &entry.value {
                StoredValue::Bytes(bytes) => bytes.as_slice() == expected,
                StoredValue::List(_) => false,
            })
            .map(|(_, entry)| !entry.is_expired(now))
            .unwrap_or(false))
    }

    async fn push_back(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| InMemoryEntry {
            value: StoredValue::List(VecDeque::new()),
            expires_at: now + ttl,
        });

        if entry.is_expired(now) {
            entry.value = StoredValue::List(VecDeque::new());
        }
        match &mut entry.value {
            StoredValue::List(list) => list.push_back(member.to_string()),
            StoredValue::Bytes(_) => {
                return Err(DroverError::new(
                    ErrorCode::CacheError,
                    format!("Key {} does not hold a list", key),
                ))
            }
        }
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            return Ok(None);
        }
        match &mut entry.value {
            StoredValue::List(list) => Ok(list.pop_front()),
            StoredValue::Bytes(_) => Err(DroverError::new(
                ErrorCode::CacheError,
                format!("Key {} does not hold a list", key),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

const DELETE_IF_EQ_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis cache backend.
pub struct RedisBackend {
    conn: ConnectionManager,
    key_prefix: String,
    delete_if_eq_script: redis::Script,
}

impl RedisBackend {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            DroverError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let mut conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await?
            .map_err(|e| {
                DroverError::with_internal(
                    ErrorCode::CacheConnectionFailed,
                    "Failed to connect to Redis",
                    e.to_string(),
                )
            })?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            DroverError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Redis ping failed",
                e.to_string(),
            )
        })?;

        info!("Redis cache backend connected to {}", config.url);

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            delete_if_eq_script: redis::Script::new(DELETE_IF_EQ_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_if_eq_script
            .key(self.full_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn push_back(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let full_key = self.full_key(key);
        redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(&full_key)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&full_key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let member: Option<String> = redis::cmd("LPOP")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(member)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
