//! Backing store implementations.
//!
//! Every component of the coordination layer talks to the store through
//! [`CacheBackend`]. Keys reaching a backend are already namespaced; values are
//! opaque bytes except for counters (ASCII decimal) and the structured kinds
//! (hash, list, set, geo index).

use crate::error::Result;
use crate::geo::{self, Coordinate, DistanceUnit, GeoMatch, GeoPoint};
use std::collections::HashMap;
use std::time::Duration;

pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::{ExpirySweeper, InMemoryBackend, StoreStats};
#[cfg(feature = "redis")]
pub use redis::{PoolStats, RedisBackend, RedisConfig};

/// Capability trait for backing stores.
///
/// Abstracts storage operations, allowing swappable backends (in-memory for a
/// single process, Redis for a cluster).
///
/// **IMPORTANT:** All methods use `&self` instead of `&mut self` to allow concurrent access.
/// Each method is atomic on its own; sequences of calls are not.
///
/// Calling a method on a key that holds another kind of value fails with
/// `Error::WrongType`.
#[allow(async_fn_in_trait)]
pub trait CacheBackend: Send + Sync + Clone {
    /// Retrieve value from cache by key.
    ///
    /// # Returns
    /// - `Ok(Some(bytes))` - Value found in cache
    /// - `Ok(None)` - Key absent or expired
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs (connection lost, etc.)
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store value with optional TTL. `None` means no expiry.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Store value only if the key is absent or expired. Returns `true` if stored.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool>;

    /// Remove a key of any kind. Missing keys are not an error.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if key exists and is unexpired.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Bulk get operation.
    ///
    /// Default implementation calls `get()` for each key.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }
        Ok(results)
    }

    /// Bulk delete operation.
    ///
    /// Default implementation calls `delete()` for each key. Atomicity is
    /// per backend: Redis removes every key in one `DEL`, while the in-memory
    /// backend removes keys one at a time, so a concurrent reader may see some
    /// keys of the batch already gone and others still present. Entity
    /// invalidation is all-or-nothing only in its end state.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Atomically add `delta` to an integer counter and return the new value.
    ///
    /// An absent or expired key starts at zero. `ttl_on_create` is applied only
    /// when this call creates the key; later increments never touch the expiry.
    ///
    /// # Errors
    /// Returns `Error::EncodingError` if the key holds a non-integer value.
    async fn incr_by(&self, key: &str, delta: i64, ttl_on_create: Option<Duration>)
        -> Result<i64>;

    /// Set the expiry of an existing key. Returns `false` if the key is absent.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live. `None` if the key is absent or has no expiry.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Delete `key` only if its current value equals `expected`.
    /// Returns `true` if the key was deleted.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Set a field of a hash, creating the hash if needed.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()>;

    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;

    /// Remove a hash field. Returns `true` if it existed.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Push to the head of a list. Returns the new length.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<usize>;

    /// Push to the tail of a list. Returns the new length.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<usize>;

    /// Inclusive range with Redis index semantics (negative counts from the tail).
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>>;

    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn llen(&self, key: &str) -> Result<usize>;

    /// Add to a set. Returns `true` if the member was new.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove from a set. Returns `true` if the member was present.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    /// Upsert positions in a geo index. Returns the number of new members.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn geo_add(&self, key: &str, points: &[GeoPoint]) -> Result<usize>;

    /// Remove a member. Returns `true` if it was present.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn geo_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Every position in the index.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn geo_members(&self, key: &str) -> Result<Vec<GeoPoint>>;

    /// Positions of `members`, omitting absent ones.
    ///
    /// Default implementation filters [`geo_members`](Self::geo_members).
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn geo_pos(&self, key: &str, members: &[&str]) -> Result<Vec<GeoPoint>> {
        let all: HashMap<String, GeoPoint> = self
            .geo_members(key)
            .await?
            .into_iter()
            .map(|p| (p.member.clone(), p))
            .collect();
        Ok(members
            .iter()
            .filter_map(|m| all.get(*m).cloned())
            .collect())
    }

    /// Members within `radius` of `center`, nearest first.
    ///
    /// Default implementation runs a haversine scan over
    /// [`geo_members`](Self::geo_members).
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn geo_radius(
        &self,
        key: &str,
        center: &Coordinate,
        radius: f64,
        unit: DistanceUnit,
    ) -> Result<Vec<GeoMatch>> {
        let points = self.geo_members(key).await?;
        Ok(geo::radius_search(points, center, radius, unit))
    }

    /// Distance between two members. `None` if either is absent.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    async fn geo_dist(
        &self,
        key: &str,
        member_a: &str,
        member_b: &str,
        unit: DistanceUnit,
    ) -> Result<Option<f64>> {
        let found = self.geo_pos(key, &[member_a, member_b]).await?;
        let a = found.iter().find(|p| p.member == member_a);
        let b = found.iter().find(|p| p.member == member_b);
        Ok(match (a, b) {
            (Some(a), Some(b)) => {
                Some(unit.from_meters(geo::haversine_meters(&a.coordinate, &b.coordinate)))
            }
            _ => None,
        })
    }

    /// Health check - verify backend is accessible.
    ///
    /// # Errors
    /// Returns `Err` if backend is not accessible
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Clear every key (use with caution).
    ///
    /// # Errors
    /// Returns `Err` if operation is not implemented or fails
    async fn clear_all(&self) -> Result<()> {
        Err(crate::error::Error::NotImplemented(
            "clear_all not implemented for this backend".to_string(),
        ))
    }
}
