//! Redis backend implementation.
//!
//! Multi-step primitives (increment with TTL on create, compare-and-delete)
//! run as Lua scripts so they stay atomic across processes. Geo commands map
//! onto Redis' native sorted-set geo index.

use super::CacheBackend;
use crate::error::{Error, Result};
use crate::geo::{Coordinate, DistanceUnit, GeoMatch, GeoPoint};
use deadpool_redis::redis::{self, AsyncCommands, Script};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use std::collections::HashMap;
use std::time::Duration;

/// Pool statistics information.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
}

/// Default Redis connection pool size.
/// Override with the `REDIS_POOL_SIZE` environment variable.
const DEFAULT_POOL_SIZE: u32 = 16;

/// `INCRBY` that sets a TTL only when the key did not exist before.
const INCR_WITH_TTL_SCRIPT: &str = r#"
local created = redis.call('EXISTS', KEYS[1]) == 0
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if created and tonumber(ARGV[2]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

/// Delete the key only while it still holds the caller's value.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub pool_size: u32,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Build Redis connection string.
    pub fn connection_string(&self) -> String {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => format!(
                "redis://{}:{}@{}:{}/{}",
                username, password, self.host, self.port, self.database
            ),
            (None, Some(password)) => format!(
                "redis://default:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }

    fn pool_config(&self) -> deadpool_redis::PoolConfig {
        let mut pool = deadpool_redis::PoolConfig::new(self.pool_size as usize);
        pool.timeouts.wait = Some(self.connection_timeout);
        pool.timeouts.create = Some(self.connection_timeout);
        pool
    }
}

/// Redis backend with connection pooling.
///
/// # Example
///
/// ```no_run
/// # use ride_cache::backend::{RedisBackend, RedisConfig, CacheBackend};
/// # use ride_cache::error::Result;
/// # async fn example() -> Result<()> {
/// let backend = RedisBackend::new(RedisConfig::default()).await?;
///
/// backend.set("key", b"value".to_vec(), None).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    incr_script: Script,
    cad_script: Script,
}

impl RedisBackend {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the pool cannot be created.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut cfg = PoolConfig::from_url(config.connection_string());
        cfg.pool = Some(config.pool_config());

        let backend = Self::from_pool_config(cfg)?;
        info!(
            "✓ Redis backend initialized: {}:{} (pool size: {})",
            config.host, config.port, config.pool_size
        );
        Ok(backend)
    }

    /// Create from connection string directly.
    ///
    /// Pool size comes from `REDIS_POOL_SIZE` when set, otherwise 16.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the pool cannot be created.
    pub async fn from_connection_string(conn_str: &str) -> Result<Self> {
        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let mut cfg = PoolConfig::from_url(conn_str);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_size as usize));

        let backend = Self::from_pool_config(cfg)?;
        info!(
            "✓ Redis backend initialized from connection string (pool size: {})",
            pool_size
        );
        Ok(backend)
    }

    /// Create from `REDIS_URL`, defaulting to a local server.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the pool cannot be created.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| RedisConfig::default().connection_string());
        Self::from_connection_string(&url).await
    }

    fn from_pool_config(cfg: PoolConfig) -> Result<Self> {
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create Redis pool: {}", e)))?;

        Ok(RedisBackend {
            pool,
            incr_script: Script::new(INCR_WITH_TTL_SCRIPT),
            cad_script: Script::new(COMPARE_AND_DELETE_SCRIPT),
        })
    }

    /// Get current pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            connections: status.size as u32,
            idle_connections: status.available as u32,
        }
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            Error::BackendUnavailable(format!("Failed to get Redis connection: {}", e))
        })
    }
}

/// Translate a Redis error into the crate's categories.
fn command_error(command: &str, key: &str, e: redis::RedisError) -> Error {
    let message = e.to_string();
    if message.contains("WRONGTYPE") {
        Error::WrongType(format!("{} on key {}", command, key))
    } else if message.contains("not an integer") {
        Error::EncodingError(format!("{} on key {}: value is not an integer", command, key))
    } else {
        Error::BackendUnavailable(format!("Redis {} failed for key {}: {}", command, key, message))
    }
}

/// Millisecond argument for `PX`/`PEXPIRE`; Redis rejects zero.
fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| command_error("GET", key, e))?;

        if value.is_some() {
            debug!("✓ Redis GET {} -> HIT", key);
        } else {
            debug!("✓ Redis GET {} -> MISS", key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut command = redis::cmd("SET");
        command.arg(key).arg(value);
        if let Some(ttl) = ttl {
            command.arg("PX").arg(millis(ttl));
        }
        command
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| command_error("SET", key, e))?;

        debug!("✓ Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut command = redis::cmd("SET");
        command.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            command.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = command
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("SET NX", key, e))?;

        debug!("✓ Redis SET NX {} -> {}", key, reply.is_some());
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| command_error("DEL", key, e))?;

        debug!("✓ Redis DELETE {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists(key)
            .await
            .map_err(|e| command_error("EXISTS", key, e))
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("MGET", &keys.join(","), e))?;

        debug!("✓ Redis MGET {} keys", keys.len());
        Ok(values)
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(keys)
            .await
            .map_err(|e| command_error("DEL", &keys.join(","), e))?;

        debug!("✓ Redis MDELETE {} keys", keys.len());
        Ok(())
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_on_create: Option<Duration>,
    ) -> Result<i64> {
        let mut conn = self.conn().await?;
        let ttl_ms = ttl_on_create.map(millis).unwrap_or(0);
        let value: i64 = self
            .incr_script
            .key(key)
            .arg(delta)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| command_error("INCRBY", key, e))?;

        debug!("✓ Redis INCRBY {} {} -> {}", key, delta, value);
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("PEXPIRE", key, e))?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn().await?;
        let remaining: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("PTTL", key, e))?;

        // -2: absent, -1: no expiry
        Ok((remaining >= 0).then(|| Duration::from_millis(remaining as u64)))
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .cad_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| command_error("compare-and-delete", key, e))?;

        debug!("✓ Redis compare-and-delete {} -> {}", key, deleted == 1);
        Ok(deleted == 1)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(|e| command_error("HSET", key, e))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.hget(key, field)
            .await
            .map_err(|e| command_error("HGET", key, e))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.hgetall(key)
            .await
            .map_err(|e| command_error("HGETALL", key, e))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .hdel(key, field)
            .await
            .map_err(|e| command_error("HDEL", key, e))?;
        Ok(removed > 0)
    }

    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<usize> {
        let mut conn = self.conn().await?;
        conn.lpush(key, value)
            .await
            .map_err(|e| command_error("LPUSH", key, e))
    }

    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<usize> {
        let mut conn = self.conn().await?;
        conn.rpush(key, value)
            .await
            .map_err(|e| command_error("RPUSH", key, e))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn().await?;
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("LRANGE", key, e))
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        conn.llen(key)
            .await
            .map_err(|e| command_error("LLEN", key, e))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let added: i64 = conn
            .sadd(key, member)
            .await
            .map_err(|e| command_error("SADD", key, e))?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .srem(key, member)
            .await
            .map_err(|e| command_error("SREM", key, e))?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.smembers(key)
            .await
            .map_err(|e| command_error("SMEMBERS", key, e))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.sismember(key, member)
            .await
            .map_err(|e| command_error("SISMEMBER", key, e))
    }

    async fn geo_add(&self, key: &str, points: &[GeoPoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let mut command = redis::cmd("GEOADD");
        command.arg(key);
        for point in points {
            command
                .arg(point.longitude())
                .arg(point.latitude())
                .arg(&point.member);
        }
        let added: usize = command
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("GEOADD", key, e))?;

        debug!("✓ Redis GEOADD {} ({} points, {} new)", key, points.len(), added);
        Ok(added)
    }

    async fn geo_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .zrem(key, member)
            .await
            .map_err(|e| command_error("ZREM", key, e))?;
        Ok(removed > 0)
    }

    async fn geo_members(&self, key: &str) -> Result<Vec<GeoPoint>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("ZRANGE", key, e))?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let refs: Vec<&str> = members.iter().map(String::as_str).collect();
        drop(conn);
        self.geo_pos(key, &refs).await
    }

    async fn geo_pos(&self, key: &str, members: &[&str]) -> Result<Vec<GeoPoint>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let positions: Vec<Option<(f64, f64)>> = redis::cmd("GEOPOS")
            .arg(key)
            .arg(members)
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("GEOPOS", key, e))?;

        Ok(members
            .iter()
            .zip(positions)
            .filter_map(|(member, pos)| {
                let (longitude, latitude) = pos?;
                Some(GeoPoint {
                    member: member.to_string(),
                    coordinate: Coordinate {
                        longitude,
                        latitude,
                    },
                })
            })
            .collect())
    }

    async fn geo_radius(
        &self,
        key: &str,
        center: &Coordinate,
        radius: f64,
        unit: DistanceUnit,
    ) -> Result<Vec<GeoMatch>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, f64, (f64, f64))> = redis::cmd("GEOSEARCH")
            .arg(key)
            .arg("FROMLONLAT")
            .arg(center.longitude)
            .arg(center.latitude)
            .arg("BYRADIUS")
            .arg(radius)
            .arg(unit.as_str())
            .arg("WITHDIST")
            .arg("WITHCOORD")
            .arg("ASC")
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("GEOSEARCH", key, e))?;

        debug!("✓ Redis GEOSEARCH {} r={}{} -> {} hits", key, radius, unit, rows.len());
        Ok(rows
            .into_iter()
            .map(|(member, distance, (longitude, latitude))| GeoMatch {
                member,
                distance,
                coordinate: Coordinate {
                    longitude,
                    latitude,
                },
            })
            .collect())
    }

    async fn geo_dist(
        &self,
        key: &str,
        member_a: &str,
        member_b: &str,
        unit: DistanceUnit,
    ) -> Result<Option<f64>> {
        let mut conn = self.conn().await?;
        redis::cmd("GEODIST")
            .arg(key)
            .arg(member_a)
            .arg(member_b)
            .arg(unit.as_str())
            .query_async(&mut *conn)
            .await
            .map_err(|e| command_error("GEODIST", key, e))
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Redis PING failed: {}", e)))?;

        Ok(pong.contains("PONG"))
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Redis FLUSHDB failed: {}", e)))?;

        warn!("⚠ Redis FLUSHDB executed - all cache cleared!");
        Ok(())
    }
}
