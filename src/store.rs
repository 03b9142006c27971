//! Namespaced key-value store with per-entry TTL.
//!
//! [`KeyValueStore`] is the foundation the other components build on. It
//! encodes values at the edge (see [`crate::serialization`]), prefixes every
//! key with the configured namespace and bounds every round-trip by the
//! configured operation timeout.

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::key::Keyspace;
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::serialization::{deserialize_from_cache, serialize_for_cache};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backend plus the key namespace and deadline shared by every component.
///
/// Clones share one open flag: once any clone is closed, every component
/// built on it refuses further round trips.
#[derive(Clone)]
pub(crate) struct Substrate<B: CacheBackend> {
    pub(crate) backend: B,
    pub(crate) keyspace: Keyspace,
    pub(crate) timeout: Option<Duration>,
    open: Arc<AtomicBool>,
}

impl<B: CacheBackend> Substrate<B> {
    pub(crate) fn new(backend: B, config: &CacheConfig) -> Self {
        Substrate {
            backend,
            keyspace: Keyspace::new(&config.namespace),
            timeout: config.operation_timeout,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Reject every later call with `Error::BackendUnavailable`.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Full backend key for a logical key.
    pub(crate) fn key(&self, logical: &str) -> String {
        self.keyspace.namespaced(logical)
    }

    /// Await a backend call, failing with `Error::Timeout` past the deadline.
    pub(crate) async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::BackendUnavailable(format!(
                "{} rejected: cache service has been shut down",
                op
            )));
        }
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("⚠ {} exceeded deadline of {:?}", op, limit);
                    Err(Error::Timeout(format!("{} exceeded {:?}", op, limit)))
                }
            },
            None => fut.await,
        }
    }
}

/// Typed, namespaced access to the backing store.
///
/// Cloning is cheap; clones share the backend and metrics sink.
///
/// # Example
///
/// ```
/// use ride_cache::backend::InMemoryBackend;
/// use ride_cache::config::CacheConfig;
/// use ride_cache::store::KeyValueStore;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> ride_cache::Result<()> {
/// let store = KeyValueStore::new(InMemoryBackend::new(), &CacheConfig::default());
///
/// store.set("ride:r-1", &"requested", Some(Duration::from_secs(1800))).await?;
/// let status: String = store.get("ride:r-1").await?;
/// assert_eq!(status, "requested");
///
/// store.delete(&["ride:r-1", "ride:never-existed"]).await?;
/// assert!(store.get::<String>("ride:r-1").await.unwrap_err().is_not_found());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KeyValueStore<B: CacheBackend> {
    substrate: Substrate<B>,
    default_ttl: Duration,
    metrics: Arc<dyn CacheMetrics>,
}

impl<B: CacheBackend> KeyValueStore<B> {
    pub fn new(backend: B, config: &CacheConfig) -> Self {
        Self::from_substrate(Substrate::new(backend, config), config.default_ttl)
    }

    pub(crate) fn from_substrate(substrate: Substrate<B>, default_ttl: Duration) -> Self {
        KeyValueStore {
            substrate,
            default_ttl,
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// TTL applied when a caller passes none.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.substrate.keyspace
    }

    /// Get backend reference (for advanced use). Keys passed to it are not namespaced.
    pub fn backend(&self) -> &B {
        &self.substrate.backend
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(d) if !d.is_zero() => d,
            _ => self.default_ttl,
        }
    }

    /// Encode and store `value`. A `None` or zero `ttl` means the default TTL.
    ///
    /// # Errors
    /// Returns `Error::EncodingError` if `value` cannot be encoded (nothing is
    /// written in that case), or a backend error.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serialize_for_cache(value).inspect_err(|e| {
            self.metrics.record_error(key, &e.to_string());
        })?;
        self.set_raw(key, bytes, ttl).await
    }

    /// Store pre-encoded bytes. A `None` or zero `ttl` means the default TTL.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn set_raw(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let timer = Instant::now();
        let full_key = self.substrate.key(key);
        let ttl = self.effective_ttl(ttl);

        let result = self
            .substrate
            .run("SET", self.substrate.backend.set(&full_key, bytes, Some(ttl)))
            .await;
        match &result {
            Ok(()) => self.metrics.record_set(&full_key, timer.elapsed()),
            Err(e) => self.metrics.record_error(&full_key, &e.to_string()),
        }
        result
    }

    /// Fetch and decode the value under `key`.
    ///
    /// # Errors
    /// - `Error::NotFound`: key absent or expired
    /// - `Error::EncodingError` / `InvalidCacheEntry` / `VersionMismatch`:
    ///   stored bytes are not a `T`
    /// - backend errors
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        match self.get_raw(key).await? {
            Some(bytes) => deserialize_from_cache(&bytes).inspect_err(|e| {
                self.metrics.record_error(key, &e.to_string());
            }),
            None => Err(Error::NotFound),
        }
    }

    /// Fetch raw bytes without decoding.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let timer = Instant::now();
        let full_key = self.substrate.key(key);

        let result = self
            .substrate
            .run("GET", self.substrate.backend.get(&full_key))
            .await;
        match &result {
            Ok(Some(_)) => self.metrics.record_hit(&full_key, timer.elapsed()),
            Ok(None) => self.metrics.record_miss(&full_key, timer.elapsed()),
            Err(e) => self.metrics.record_error(&full_key, &e.to_string()),
        }
        result
    }

    /// Fetch several keys at once. Absent keys yield `None`.
    ///
    /// # Errors
    /// Fails on the first entry that does not decode, or on a backend error.
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<Vec<Option<T>>> {
        let full_keys: Vec<String> = keys.iter().map(|k| self.substrate.key(k)).collect();
        let refs: Vec<&str> = full_keys.iter().map(String::as_str).collect();

        let raw = self
            .substrate
            .run("MGET", self.substrate.backend.mget(&refs))
            .await?;
        raw.into_iter()
            .map(|bytes| bytes.map(|b| deserialize_from_cache(&b)).transpose())
            .collect()
    }

    /// Remove zero or more keys. Keys that do not exist are ignored.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn delete(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let timer = Instant::now();
        let full_keys: Vec<String> = keys.iter().map(|k| self.substrate.key(k)).collect();
        let refs: Vec<&str> = full_keys.iter().map(String::as_str).collect();

        self.substrate
            .run("DEL", self.substrate.backend.mdelete(&refs))
            .await?;
        for key in &full_keys {
            self.metrics.record_delete(key, timer.elapsed());
        }
        Ok(())
    }

    /// `true` if the key is present and unexpired. Never decodes.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("EXISTS", self.substrate.backend.exists(&full_key))
            .await
    }

    /// Store `value` only if `key` is absent. Returns `true` if stored.
    ///
    /// # Errors
    /// Returns `Error::EncodingError` or a backend error.
    pub async fn set_nx<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let bytes = serialize_for_cache(value)?;
        let full_key = self.substrate.key(key);
        let ttl = self.effective_ttl(ttl);
        self.substrate
            .run(
                "SETNX",
                self.substrate.backend.set_nx(&full_key, bytes, Some(ttl)),
            )
            .await
    }

    /// Reset the expiry of an existing key. Returns `false` if absent.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("EXPIRE", self.substrate.backend.expire(&full_key, ttl))
            .await
    }

    /// Remaining TTL. `None` if absent or persistent.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("TTL", self.substrate.backend.ttl(&full_key))
            .await
    }

    // ------------------------------------------------------------------
    // Hashes
    // ------------------------------------------------------------------

    /// # Errors
    /// Returns `Error::EncodingError`, `Error::WrongType` or a backend error.
    pub async fn hset<T: Serialize + ?Sized>(&self, key: &str, field: &str, value: &T) -> Result<()> {
        let bytes = serialize_for_cache(value)?;
        let full_key = self.substrate.key(key);
        self.substrate
            .run("HSET", self.substrate.backend.hset(&full_key, field, bytes))
            .await
    }

    /// # Errors
    /// Returns `Error::WrongType`, a decoding error or a backend error.
    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> Result<Option<T>> {
        let full_key = self.substrate.key(key);
        let raw = self
            .substrate
            .run("HGET", self.substrate.backend.hget(&full_key, field))
            .await?;
        raw.map(|bytes| deserialize_from_cache(&bytes)).transpose()
    }

    /// # Errors
    /// Returns `Error::WrongType`, a decoding error or a backend error.
    pub async fn hgetall<T: DeserializeOwned>(&self, key: &str) -> Result<HashMap<String, T>> {
        let full_key = self.substrate.key(key);
        let raw = self
            .substrate
            .run("HGETALL", self.substrate.backend.hgetall(&full_key))
            .await?;
        raw.into_iter()
            .map(|(field, bytes)| Ok((field, deserialize_from_cache(&bytes)?)))
            .collect()
    }

    /// # Errors
    /// Returns `Error::WrongType` or a backend error.
    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("HDEL", self.substrate.backend.hdel(&full_key, field))
            .await
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    /// # Errors
    /// Returns `Error::EncodingError`, `Error::WrongType` or a backend error.
    pub async fn lpush<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<usize> {
        let bytes = serialize_for_cache(value)?;
        let full_key = self.substrate.key(key);
        self.substrate
            .run("LPUSH", self.substrate.backend.lpush(&full_key, bytes))
            .await
    }

    /// # Errors
    /// Returns `Error::EncodingError`, `Error::WrongType` or a backend error.
    pub async fn rpush<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<usize> {
        let bytes = serialize_for_cache(value)?;
        let full_key = self.substrate.key(key);
        self.substrate
            .run("RPUSH", self.substrate.backend.rpush(&full_key, bytes))
            .await
    }

    /// Inclusive range; negative indices count from the tail.
    ///
    /// # Errors
    /// Returns `Error::WrongType`, a decoding error or a backend error.
    pub async fn lrange<T: DeserializeOwned>(&self, key: &str, start: i64, stop: i64) -> Result<Vec<T>> {
        let full_key = self.substrate.key(key);
        let raw = self
            .substrate
            .run("LRANGE", self.substrate.backend.lrange(&full_key, start, stop))
            .await?;
        raw.iter().map(|bytes| deserialize_from_cache(bytes)).collect()
    }

    /// # Errors
    /// Returns `Error::WrongType` or a backend error.
    pub async fn llen(&self, key: &str) -> Result<usize> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("LLEN", self.substrate.backend.llen(&full_key))
            .await
    }

    // ------------------------------------------------------------------
    // Sets
    // ------------------------------------------------------------------

    /// # Errors
    /// Returns `Error::WrongType` or a backend error.
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("SADD", self.substrate.backend.sadd(&full_key, member))
            .await
    }

    /// # Errors
    /// Returns `Error::WrongType` or a backend error.
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("SREM", self.substrate.backend.srem(&full_key, member))
            .await
    }

    /// Members in lexicographic order.
    ///
    /// # Errors
    /// Returns `Error::WrongType` or a backend error.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let full_key = self.substrate.key(key);
        let mut members = self
            .substrate
            .run("SMEMBERS", self.substrate.backend.smembers(&full_key))
            .await?;
        members.sort();
        Ok(members)
    }

    /// # Errors
    /// Returns `Error::WrongType` or a backend error.
    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("SISMEMBER", self.substrate.backend.sismember(&full_key, member))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct Payment {
        id: String,
        amount_cents: i64,
    }

    fn store() -> (KeyValueStore<InMemoryBackend>, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let store = KeyValueStore::new(backend.clone(), &CacheConfig::default());
        (store, backend)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (store, _) = store();
        let payment = Payment {
            id: "p-1".to_string(),
            amount_cents: 2500,
        };

        store.set("payment:p-1", &payment, None).await.unwrap();
        let cached: Payment = store.get("payment:p-1").await.unwrap();
        assert_eq!(cached, payment);
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let (store, backend) = store();
        store.set("user:1", &1u32, None).await.unwrap();

        assert!(backend.exists("ride:user:1").await.unwrap());
        assert!(!backend.exists("user:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_ttl_uses_default() {
        let (store, _) = store();
        store.set("k", &"v", None).await.unwrap();
        store.set("z", &"v", Some(Duration::ZERO)).await.unwrap();

        for key in ["k", "z"] {
            let ttl = store.ttl(key).await.unwrap().expect("default TTL applied");
            assert!(ttl > Duration::from_secs(3590) && ttl <= store.default_ttl());
        }
    }

    #[tokio::test]
    async fn test_get_after_expiry_is_not_found() {
        let (store, _) = store();
        store
            .set("session:s1", &"token", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(store.get::<String>("session:s1").await.unwrap(), "token");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            store.get::<String>("session:s1").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_get_wrong_shape_is_encoding_error() {
        let (store, _) = store();
        store.set("k", &"not a payment", None).await.unwrap();
        let err = store.get::<Payment>("k").await.unwrap_err();
        assert!(err.is_encoding());
    }

    #[tokio::test]
    async fn test_delete_many_ignores_missing() {
        let (store, _) = store();
        store.set("a", &1u8, None).await.unwrap();
        store.set("b", &2u8, None).await.unwrap();

        store.delete(&["a", "b", "never"]).await.unwrap();
        store.delete(&[]).await.unwrap();
        assert!(!store.exists("a").await.unwrap());
        assert!(!store.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_many() {
        let (store, _) = store();
        store.set("a", &1u32, None).await.unwrap();
        store.set("c", &3u32, None).await.unwrap();

        let values: Vec<Option<u32>> = store.get_many(&["a", "b", "c"]).await.unwrap();
        assert_eq!(values, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn test_set_nx() {
        let (store, _) = store();
        assert!(store.set_nx("once", &"first", None).await.unwrap());
        assert!(!store.set_nx("once", &"second", None).await.unwrap());
        assert_eq!(store.get::<String>("once").await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_structured_wrappers() {
        let (store, _) = store();

        store.hset("ride:r-1:meta", "status", &"en_route").await.unwrap();
        assert_eq!(
            store.hget::<String>("ride:r-1:meta", "status").await.unwrap(),
            Some("en_route".to_string())
        );
        assert_eq!(store.hgetall::<String>("ride:r-1:meta").await.unwrap().len(), 1);

        store.rpush("chat:c-1", &"hello").await.unwrap();
        store.rpush("chat:c-1", &"there").await.unwrap();
        let messages: Vec<String> = store.lrange("chat:c-1", 0, -1).await.unwrap();
        assert_eq!(messages, vec!["hello", "there"]);
        assert_eq!(store.llen("chat:c-1").await.unwrap(), 2);

        assert!(store.sadd("online", "d-2").await.unwrap());
        assert!(store.sadd("online", "d-1").await.unwrap());
        assert_eq!(store.smembers("online").await.unwrap(), vec!["d-1", "d-2"]);
        assert!(store.srem("online", "d-1").await.unwrap());
        assert!(!store.sismember("online", "d-1").await.unwrap());
    }

    #[derive(Default)]
    struct Counting {
        hits: AtomicUsize,
        misses: AtomicUsize,
        sets: AtomicUsize,
    }

    impl CacheMetrics for Counting {
        fn record_hit(&self, _key: &str, _duration: Duration) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        fn record_miss(&self, _key: &str, _duration: Duration) {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fn record_set(&self, _key: &str, _duration: Duration) {
            self.sets.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn test_metrics_hooks_invoked() {
        let metrics = Arc::new(Counting::default());
        let (store, _) = store();
        let store = store.with_metrics(metrics.clone());

        store.set("k", &1u8, None).await.unwrap();
        let _: u8 = store.get("k").await.unwrap();
        let _ = store.get::<u8>("missing").await;

        assert_eq!(metrics.sets.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.hits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_substrate_run_times_out() {
        let config = CacheConfig::default().with_operation_timeout(Some(Duration::from_millis(10)));
        let substrate = Substrate::new(InMemoryBackend::new(), &config);

        let result: Result<()> = substrate
            .run("SLOW", async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
