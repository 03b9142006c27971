//! In-memory cache backend (default, thread-safe, async).
//!
//! Uses DashMap for concurrent access with per-key sharding. Every
//! read-modify-write runs while holding the shard guard for its key, which
//! makes `incr_by`, `set_nx` and `compare_and_delete` atomic without a global
//! lock. None of the trait methods await, so dropping one of their futures can
//! never leave a half-applied write behind.
//!
//! Expiration is lazy: an expired entry is treated as absent and removed on
//! the next access. [`InMemoryBackend::start_expiry_sweeper`] additionally
//! purges entries nobody touches again.

use super::CacheBackend;
use crate::error::{Error, Result};
use crate::geo::{Coordinate, GeoPoint};
use crate::serialization::{decode_counter, encode_counter};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Stored value kinds.
enum Value {
    Bytes(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<String>),
    Geo(HashMap<String, Coordinate>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Geo(_) => "geo index",
        }
    }

    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Bytes(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::Geo(g) => g.is_empty(),
        }
    }

    fn approx_bytes(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::Hash(h) => h.iter().map(|(k, v)| k.len() + v.len()).sum(),
            Value::List(l) => l.iter().map(Vec::len).sum(),
            Value::Set(s) => s.iter().map(String::len).sum(),
            Value::Geo(g) => g.keys().map(|k| k.len() + 16).sum(),
        }
    }
}

/// In-memory cache entry with optional expiration.
struct StoreEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.map(|d| Instant::now() + d);
        StoreEntry { value, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> Error {
    Error::WrongType(format!(
        "key {} holds a {}, not a {}",
        key,
        found.kind(),
        expected
    ))
}

/// Thread-safe async in-memory backend.
///
/// Cloning is cheap and clones share the same store.
///
/// # Example
///
/// ```no_run
/// use ride_cache::backend::{InMemoryBackend, CacheBackend};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = InMemoryBackend::new();
///
///     backend.set("ride:1", b"requested".to_vec(), Some(Duration::from_secs(1800))).await?;
///     assert!(backend.get("ride:1").await?.is_some());
///
///     let hits = backend.incr_by("rate_limit:ip:1", 1, Some(Duration::from_secs(60))).await?;
///     assert_eq!(hits, 1);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, StoreEntry>>,
}

impl InMemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        InMemoryBackend {
            store: Arc::new(DashMap::new()),
        }
    }

    /// Number of physically stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Get memory statistics.
    pub async fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for entry in self.store.iter() {
            stats.total_entries += 1;
            if entry.is_expired() {
                stats.expired_entries += 1;
            }
            stats.total_bytes += entry.key().len() + entry.value.approx_bytes();
        }
        stats
    }

    /// Print store statistics to debug log.
    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        debug!(
            "Store Stats: {} entries ({} expired), {} bytes",
            stats.total_entries, stats.expired_entries, stats.total_bytes
        );
    }

    /// Physically remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.store.len());
        if removed > 0 {
            debug!("✓ InMemory PURGE removed {} expired entries", removed);
        }
        removed
    }

    /// Spawn a task that calls [`purge_expired`](Self::purge_expired) every `interval`.
    ///
    /// Must be called from within a Tokio runtime. The task stops when the
    /// returned [`ExpirySweeper`] is stopped or dropped.
    pub fn start_expiry_sweeper(&self, interval: Duration) -> ExpirySweeper {
        let backend = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                backend.purge_expired();
            }
        });
        info!("✓ InMemory expiry sweeper started (interval: {:?})", interval);
        ExpirySweeper { handle }
    }

    /// Run `f` on the live entry for `key`, creating it with `init` if the key
    /// is absent or expired. The flag tells `f` whether the entry was created.
    fn upsert<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut StoreEntry, bool) -> Result<R>,
    ) -> Result<R> {
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let created = occupied.get().is_expired();
                if created {
                    occupied.insert(StoreEntry::new(init(), None));
                }
                f(occupied.get_mut(), created)
            }
            Entry::Vacant(vacant) => {
                let mut slot = vacant.insert(StoreEntry::new(init(), None));
                f(slot.value_mut(), true)
            }
        }
    }

    /// Run `f` on the live entry for `key`, if any.
    fn read<R>(&self, key: &str, f: impl FnOnce(&Value) -> Result<R>) -> Result<Option<R>> {
        let result = match self.store.get(key) {
            Some(entry) if !entry.is_expired() => Some(f(&entry.value)?),
            _ => None,
        };
        if result.is_none() {
            self.store.remove_if(key, |_, entry| entry.is_expired());
        }
        Ok(result)
    }

    /// Mutate an existing live collection, then drop the key if it became empty.
    fn shrink<R: Default>(&self, key: &str, f: impl FnOnce(&mut Value) -> Result<R>) -> Result<R> {
        let result = match self.store.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => f(&mut entry.value)?,
            _ => R::default(),
        };
        self.store
            .remove_if(key, |_, entry| entry.is_expired() || entry.value.is_empty_collection());
        Ok(result)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the background expiry task.
pub struct ExpirySweeper {
    handle: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Stop the sweeper.
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.read(key, |value| match value {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(wrong_type(key, "string", other)),
        })?;
        if value.is_some() {
            debug!("✓ InMemory GET {} -> HIT", key);
        } else {
            debug!("✓ InMemory GET {} -> MISS", key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.store
            .insert(key.to_string(), StoreEntry::new(Value::Bytes(value), ttl));

        if let Some(d) = ttl {
            debug!("✓ InMemory SET {} (TTL: {:?})", key, d);
        } else {
            debug!("✓ InMemory SET {}", key);
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let stored = match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoreEntry::new(Value::Bytes(value), ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoreEntry::new(Value::Bytes(value), ttl));
                true
            }
        };
        debug!("✓ InMemory SETNX {} -> {}", key, stored);
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.read(key, |_| Ok(()))?.is_some())
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            // MGET reports non-string keys as missing rather than failing the batch
            let value = self
                .read(key, |value| match value {
                    Value::Bytes(bytes) => Ok(Some(bytes.clone())),
                    _ => Ok(None),
                })?
                .flatten();
            results.push(value);
        }
        debug!("✓ InMemory MGET {} keys", keys.len());
        Ok(results)
    }

    /// Removes keys one by one; not atomic across the batch.
    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.store.remove(*key);
        }
        debug!("✓ InMemory MDELETE {} keys", keys.len());
        Ok(())
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_on_create: Option<Duration>,
    ) -> Result<i64> {
        let value = self.upsert(
            key,
            || Value::Bytes(encode_counter(0)),
            |entry, created| match &mut entry.value {
                Value::Bytes(bytes) => {
                    let current = decode_counter(bytes)?;
                    let next = current.checked_add(delta).ok_or_else(|| {
                        Error::ValidationError(format!("counter {} would overflow", key))
                    })?;
                    *bytes = encode_counter(next);
                    if created {
                        entry.expires_at = ttl_on_create.map(|d| Instant::now() + d);
                    }
                    Ok(next)
                }
                other => Err(wrong_type(key, "counter", other)),
            },
        )?;
        debug!("✓ InMemory INCRBY {} {} -> {}", key, delta, value);
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated = match self.store.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        };
        debug!("✓ InMemory EXPIRE {} {:?} -> {}", key, ttl, updated);
        Ok(updated)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let remaining = match self.store.get(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at.map(|exp| exp.saturating_duration_since(now))
            }
            _ => None,
        };
        Ok(remaining)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let removed = self
            .store
            .remove_if(key, |_, entry| {
                !entry.is_expired()
                    && matches!(&entry.value, Value::Bytes(current) if current.as_slice() == expected)
            })
            .is_some();
        debug!("✓ InMemory CAD {} -> {}", key, removed);
        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        self.upsert(
            key,
            || Value::Hash(HashMap::new()),
            |entry, _| match &mut entry.value {
                Value::Hash(hash) => {
                    hash.insert(field.to_string(), value);
                    Ok(())
                }
                other => Err(wrong_type(key, "hash", other)),
            },
        )
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .read(key, |value| match value {
                Value::Hash(hash) => Ok(hash.get(field).cloned()),
                other => Err(wrong_type(key, "hash", other)),
            })?
            .flatten())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self
            .read(key, |value| match value {
                Value::Hash(hash) => Ok(hash.clone()),
                other => Err(wrong_type(key, "hash", other)),
            })?
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.shrink(key, |value| match value {
            Value::Hash(hash) => Ok(hash.remove(field).is_some()),
            other => Err(wrong_type(key, "hash", other)),
        })
    }

    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<usize> {
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |entry, _| match &mut entry.value {
                Value::List(list) => {
                    list.push_front(value);
                    Ok(list.len())
                }
                other => Err(wrong_type(key, "list", other)),
            },
        )
    }

    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<usize> {
        self.upsert(
            key,
            || Value::List(VecDeque::new()),
            |entry, _| match &mut entry.value {
                Value::List(list) => {
                    list.push_back(value);
                    Ok(list.len())
                }
                other => Err(wrong_type(key, "list", other)),
            },
        )
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .read(key, |value| match value {
                Value::List(list) => Ok(match list_bounds(list.len(), start, stop) {
                    Some((from, to)) => list.range(from..=to).cloned().collect(),
                    None => Vec::new(),
                }),
                other => Err(wrong_type(key, "list", other)),
            })?
            .unwrap_or_default())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self
            .read(key, |value| match value {
                Value::List(list) => Ok(list.len()),
                other => Err(wrong_type(key, "list", other)),
            })?
            .unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.upsert(
            key,
            || Value::Set(HashSet::new()),
            |entry, _| match &mut entry.value {
                Value::Set(set) => Ok(set.insert(member.to_string())),
                other => Err(wrong_type(key, "set", other)),
            },
        )
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.shrink(key, |value| match value {
            Value::Set(set) => Ok(set.remove(member)),
            other => Err(wrong_type(key, "set", other)),
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut members = self
            .read(key, |value| match value {
                Value::Set(set) => Ok(set.iter().cloned().collect::<Vec<_>>()),
                other => Err(wrong_type(key, "set", other)),
            })?
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .read(key, |value| match value {
                Value::Set(set) => Ok(set.contains(member)),
                other => Err(wrong_type(key, "set", other)),
            })?
            .unwrap_or(false))
    }

    async fn geo_add(&self, key: &str, points: &[GeoPoint]) -> Result<usize> {
        let added = self.upsert(
            key,
            || Value::Geo(HashMap::new()),
            |entry, _| match &mut entry.value {
                Value::Geo(index) => Ok(points
                    .iter()
                    .filter(|p| index.insert(p.member.clone(), p.coordinate).is_none())
                    .count()),
                other => Err(wrong_type(key, "geo index", other)),
            },
        )?;
        debug!("✓ InMemory GEOADD {} {} points ({} new)", key, points.len(), added);
        Ok(added)
    }

    async fn geo_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.shrink(key, |value| match value {
            Value::Geo(index) => Ok(index.remove(member).is_some()),
            other => Err(wrong_type(key, "geo index", other)),
        })
    }

    async fn geo_members(&self, key: &str) -> Result<Vec<GeoPoint>> {
        let mut points = self
            .read(key, |value| match value {
                Value::Geo(index) => Ok(index
                    .iter()
                    .map(|(member, coordinate)| GeoPoint {
                        member: member.clone(),
                        coordinate: *coordinate,
                    })
                    .collect::<Vec<_>>()),
                other => Err(wrong_type(key, "geo index", other)),
            })?
            .unwrap_or_default();
        points.sort_by(|a, b| a.member.cmp(&b.member));
        Ok(points)
    }

    async fn geo_pos(&self, key: &str, members: &[&str]) -> Result<Vec<GeoPoint>> {
        Ok(self
            .read(key, |value| match value {
                Value::Geo(index) => Ok(members
                    .iter()
                    .filter_map(|m| {
                        index.get(*m).map(|coordinate| GeoPoint {
                            member: (*m).to_string(),
                            coordinate: *coordinate,
                        })
                    })
                    .collect::<Vec<_>>()),
                other => Err(wrong_type(key, "geo index", other)),
            })?
            .unwrap_or_default())
    }

    async fn health_check(&self) -> Result<bool> {
        // In-memory backend is always healthy
        Ok(true)
    }

    async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ InMemory CLEAR_ALL executed - all cache cleared!");
        Ok(())
    }
}

/// Translate Redis-style inclusive indices into a valid `from..=to` range.
fn list_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_backend_set_get() {
        let backend = InMemoryBackend::new();

        backend
            .set("key1", b"value1".to_vec(), None)
            .await
            .expect("Failed to set");

        let result = backend.get("key1").await.expect("Failed to get");
        assert_eq!(result, Some(b"value1".to_vec()));
    }

    #[tokio::test]
    async fn test_inmemory_backend_miss() {
        let backend = InMemoryBackend::new();

        let result = backend.get("nonexistent").await.expect("Failed to get");
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_inmemory_backend_ttl_expiration() {
        let backend = InMemoryBackend::new();

        backend
            .set("key1", b"value1".to_vec(), Some(Duration::from_millis(100)))
            .await
            .expect("Failed to set");
        assert!(backend.get("key1").await.expect("Failed to get").is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(backend.get("key1").await.expect("Failed to get").is_none());
        assert!(!backend.exists("key1").await.expect("Failed to check exists"));
        // lazily purged on access
        assert_eq!(backend.len().await, 0);
    }

    #[tokio::test]
    async fn test_inmemory_backend_mget_mdelete() {
        let backend = InMemoryBackend::new();
        backend.set("key1", b"value1".to_vec(), None).await.unwrap();
        backend.set("key2", b"value2".to_vec(), None).await.unwrap();
        backend.sadd("set", "m").await.unwrap();

        let results = backend
            .mget(&["key1", "key2", "key3", "set"])
            .await
            .expect("Failed to mget");
        assert_eq!(
            results,
            vec![Some(b"value1".to_vec()), Some(b"value2".to_vec()), None, None]
        );

        backend.mdelete(&["key1", "key3"]).await.unwrap();
        assert_eq!(backend.len().await, 2);
    }

    #[tokio::test]
    async fn test_mdelete_clears_every_kind_in_batch() {
        let backend = InMemoryBackend::new();
        backend.set("user:u-1", b"ada".to_vec(), None).await.unwrap();
        backend.hset("user_profile:u-1", "city", b"berlin".to_vec()).await.unwrap();
        backend.sadd("user_permissions:u-1", "rides:read").await.unwrap();

        backend
            .mdelete(&["user:u-1", "user_profile:u-1", "user_permissions:u-1", "absent"])
            .await
            .unwrap();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_set_nx_respects_live_and_expired_keys() {
        let backend = InMemoryBackend::new();

        assert!(backend
            .set_nx("lock:a", b"t1".to_vec(), Some(Duration::from_millis(50)))
            .await
            .unwrap());
        assert!(!backend.set_nx("lock:a", b"t2".to_vec(), None).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(backend.set_nx("lock:a", b"t3".to_vec(), None).await.unwrap());
        assert_eq!(backend.get("lock:a").await.unwrap(), Some(b"t3".to_vec()));
    }

    #[tokio::test]
    async fn test_incr_by_sets_ttl_only_on_create() {
        let backend = InMemoryBackend::new();
        let window = Some(Duration::from_secs(60));

        assert_eq!(backend.incr_by("c", 1, window).await.unwrap(), 1);
        let first_ttl = backend.ttl("c").await.unwrap().expect("ttl set on create");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.incr_by("c", 4, window).await.unwrap(), 5);
        let second_ttl = backend.ttl("c").await.unwrap().expect("ttl still set");
        assert!(second_ttl < first_ttl);

        assert_eq!(backend.incr_by("c", -7, None).await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_incr_by_rejects_non_counter() {
        let backend = InMemoryBackend::new();
        backend.set("blob", vec![0xff, 0x00], None).await.unwrap();
        let err = backend.incr_by("blob", 1, None).await.unwrap_err();
        assert!(err.is_encoding());

        backend.hset("hash", "f", b"1".to_vec()).await.unwrap();
        assert!(matches!(
            backend.incr_by("hash", 1, None).await,
            Err(Error::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let backend = InMemoryBackend::new();
        backend.set("lock:r", b"owner".to_vec(), None).await.unwrap();

        assert!(!backend.compare_and_delete("lock:r", b"intruder").await.unwrap());
        assert!(backend.exists("lock:r").await.unwrap());
        assert!(backend.compare_and_delete("lock:r", b"owner").await.unwrap());
        assert!(!backend.exists("lock:r").await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_and_ttl() {
        let backend = InMemoryBackend::new();
        assert!(!backend.expire("missing", Duration::from_secs(1)).await.unwrap());

        backend.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(backend.ttl("k").await.unwrap(), None);
        assert!(backend.expire("k", Duration::from_secs(30)).await.unwrap());
        let ttl = backend.ttl("k").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(30) && ttl > Duration::from_secs(29));
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let backend = InMemoryBackend::new();
        backend.hset("h", "a", b"1".to_vec()).await.unwrap();
        backend.hset("h", "b", b"2".to_vec()).await.unwrap();

        assert_eq!(backend.hget("h", "a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.hget("h", "z").await.unwrap(), None);
        assert_eq!(backend.hgetall("h").await.unwrap().len(), 2);

        assert!(backend.hdel("h", "a").await.unwrap());
        assert!(backend.hdel("h", "b").await.unwrap());
        assert!(!backend.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_operations() {
        let backend = InMemoryBackend::new();
        backend.rpush("l", b"b".to_vec()).await.unwrap();
        backend.rpush("l", b"c".to_vec()).await.unwrap();
        assert_eq!(backend.lpush("l", b"a".to_vec()).await.unwrap(), 3);

        let all = backend.lrange("l", 0, -1).await.unwrap();
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(backend.lrange("l", -2, -1).await.unwrap().len(), 2);
        assert_eq!(backend.lrange("l", 0, 100).await.unwrap().len(), 3);
        assert!(backend.lrange("l", 5, 10).await.unwrap().is_empty());
        assert_eq!(backend.llen("l").await.unwrap(), 3);
        assert_eq!(backend.llen("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_operations() {
        let backend = InMemoryBackend::new();
        assert!(backend.sadd("s", "b").await.unwrap());
        assert!(backend.sadd("s", "a").await.unwrap());
        assert!(!backend.sadd("s", "a").await.unwrap());

        assert_eq!(backend.smembers("s").await.unwrap(), vec!["a", "b"]);
        assert!(backend.sismember("s", "a").await.unwrap());
        assert!(backend.srem("s", "a").await.unwrap());
        assert!(!backend.sismember("s", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let backend = InMemoryBackend::new();
        backend.sadd("s", "a").await.unwrap();

        assert!(matches!(backend.get("s").await, Err(Error::WrongType(_))));
        assert!(matches!(
            backend.geo_add("s", &[GeoPoint::new("x", 0.0, 0.0).unwrap()]).await,
            Err(Error::WrongType(_))
        ));
        // set overwrites whatever was there
        backend.set("s", b"plain".to_vec(), None).await.unwrap();
        assert_eq!(backend.get("s").await.unwrap(), Some(b"plain".to_vec()));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let backend = InMemoryBackend::new();
        backend
            .set("short", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        backend.set("long", b"v".to_vec(), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.stats().await.expired_entries, 1);
        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_expiry_sweeper_purges_in_background() {
        let backend = InMemoryBackend::new();
        backend
            .set("short", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();

        let sweeper = backend.start_expiry_sweeper(Duration::from_millis(20));
        assert!(sweeper.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(backend.len().await, 0);
        sweeper.stop();
    }

    #[tokio::test]
    async fn test_inmemory_backend_clear_all() {
        let backend = InMemoryBackend::new();
        backend.set("key1", b"value1".to_vec(), None).await.unwrap();
        backend.sadd("set", "m").await.unwrap();

        backend.clear_all().await.expect("Failed to clear");
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_inmemory_backend_clone_shares_store() {
        let backend1 = InMemoryBackend::new();
        backend1.set("key", b"value".to_vec(), None).await.unwrap();

        let backend2 = backend1.clone();
        assert_eq!(backend2.get("key").await.unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_list_bounds() {
        assert_eq!(list_bounds(3, 0, -1), Some((0, 2)));
        assert_eq!(list_bounds(3, -10, 1), Some((0, 1)));
        assert_eq!(list_bounds(3, 2, 1), None);
        assert_eq!(list_bounds(0, 0, -1), None);
    }
}
