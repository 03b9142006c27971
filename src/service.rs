//! High-level coordination service.
//!
//! [`CacheService`] is constructed once at startup and injected wherever it is
//! needed. It is `Clone` over an `Arc`, so handing a copy to every request
//! handler is cheap, and every component shares one backend, one namespace and
//! one pub/sub hub.

use crate::backend::{CacheBackend, ExpirySweeper, InMemoryBackend};
use crate::config::CacheConfig;
use crate::counter::AtomicCounter;
use crate::error::{Error, Result};
use crate::facade::EntityCache;
use crate::geo::{DistanceUnit, GeoMatch, GeoPoint, GeospatialIndex};
use crate::lock::{DistributedLock, LockHandle};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::pubsub::{PubSub, Subscription};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::store::{KeyValueStore, Substrate};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ServiceInner<B: CacheBackend> {
    substrate: Substrate<B>,
    config: CacheConfig,
    kv: KeyValueStore<B>,
    counters: AtomicCounter<B>,
    rate_limiter: RateLimiter<B>,
    locks: DistributedLock<B>,
    geo: GeospatialIndex<B>,
    pubsub: PubSub,
    entities: EntityCache<B>,
    sweeper: Mutex<Option<ExpirySweeper>>,
    shut_down: AtomicBool,
}

/// The coordination layer: key-value cache, counters, rate limiting, locks,
/// geospatial index, pub/sub and entity helpers over one backend.
///
/// # Example
///
/// ```
/// use ride_cache::{CacheService, backend::InMemoryBackend};
/// use ride_cache::geo::{DistanceUnit, GeoPoint};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> ride_cache::Result<()> {
/// let cache = CacheService::new(InMemoryBackend::new());
///
/// cache.set("ride:r-1", &"requested", Some(Duration::from_secs(1800))).await?;
/// let status: String = cache.get("ride:r-1").await?;
/// assert_eq!(status, "requested");
///
/// cache.geo_add("drivers", &[GeoPoint::new("d1", -122.42, 37.77)?]).await?;
/// let hits = cache.geo_radius("drivers", -122.42, 37.77, 5.0, DistanceUnit::Kilometers).await?;
/// assert_eq!(hits[0].member, "d1");
///
/// cache.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CacheService<B: CacheBackend> {
    inner: Arc<ServiceInner<B>>,
}

impl<B: CacheBackend> CacheService<B> {
    /// Create a service with the default configuration.
    pub fn new(backend: B) -> Self {
        Self::build(backend, CacheConfig::default(), Arc::new(NoOpMetrics))
    }

    /// Create a service with an explicit configuration.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if `config` fails validation.
    pub fn with_config(backend: B, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(backend, config, Arc::new(NoOpMetrics)))
    }

    /// Create a service whose key-value store reports to `metrics`.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if `config` fails validation.
    pub fn with_metrics(
        backend: B,
        config: CacheConfig,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(backend, config, metrics))
    }

    fn build(backend: B, config: CacheConfig, metrics: Arc<dyn CacheMetrics>) -> Self {
        let substrate = Substrate::new(backend, &config);
        let inner = ServiceInner {
            kv: KeyValueStore::from_substrate(substrate.clone(), config.default_ttl)
                .with_metrics(metrics),
            counters: AtomicCounter::from_substrate(substrate.clone()),
            rate_limiter: RateLimiter::from_substrate(substrate.clone()),
            locks: DistributedLock::from_substrate(substrate.clone()),
            geo: GeospatialIndex::from_substrate(substrate.clone()),
            pubsub: PubSub::new(&config),
            entities: EntityCache::from_substrate(substrate.clone(), config.default_ttl),
            sweeper: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            substrate,
            config,
        };
        info!(
            "✓ Cache service initialized (namespace: {:?}, default TTL: {:?})",
            inner.config.namespace, inner.config.default_ttl
        );
        CacheService {
            inner: Arc::new(inner),
        }
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub fn kv(&self) -> &KeyValueStore<B> {
        &self.inner.kv
    }

    pub fn counters(&self) -> &AtomicCounter<B> {
        &self.inner.counters
    }

    pub fn rate_limiter(&self) -> &RateLimiter<B> {
        &self.inner.rate_limiter
    }

    pub fn locks(&self) -> &DistributedLock<B> {
        &self.inner.locks
    }

    pub fn geo(&self) -> &GeospatialIndex<B> {
        &self.inner.geo
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.inner.pubsub
    }

    pub fn entities(&self) -> &EntityCache<B> {
        &self.inner.entities
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get backend reference (for advanced use). Keys passed to it are not namespaced.
    pub fn backend(&self) -> &B {
        &self.inner.substrate.backend
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(Error::BackendUnavailable(
                "cache service has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Key-value
    // ------------------------------------------------------------------

    /// See [`KeyValueStore::get`].
    ///
    /// # Errors
    /// `Error::NotFound` on a miss; decoding and backend errors otherwise.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.ensure_running()?;
        self.inner.kv.get(key).await
    }

    /// See [`KeyValueStore::set`].
    ///
    /// # Errors
    /// Returns `Error::EncodingError` or a backend error.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.inner.kv.set(key, value, ttl).await
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn delete(&self, keys: &[&str]) -> Result<()> {
        self.ensure_running()?;
        self.inner.kv.delete(keys).await
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_running()?;
        self.inner.kv.exists(key).await
    }

    /// # Errors
    /// Returns `Error::EncodingError` or a backend error.
    pub async fn set_nx<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.ensure_running()?;
        self.inner.kv.set_nx(key, value, ttl).await
    }

    // ------------------------------------------------------------------
    // Counters and rate limiting
    // ------------------------------------------------------------------

    /// # Errors
    /// See [`AtomicCounter::increment`].
    pub async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        self.ensure_running()?;
        self.inner.counters.increment(key, delta, ttl).await
    }

    /// # Errors
    /// See [`AtomicCounter::decrement`].
    pub async fn decrement(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        self.ensure_running()?;
        self.inner.counters.decrement(key, delta, ttl).await
    }

    /// # Errors
    /// See [`RateLimiter::check`]. A denial is an `Ok` result.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitResult> {
        self.ensure_running()?;
        self.inner.rate_limiter.check(key, limit, window).await
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// # Errors
    /// `Error::LockHeld` if another holder owns the lock.
    pub async fn lock(&self, key: &str, ttl: Duration) -> Result<LockHandle> {
        self.ensure_running()?;
        self.inner.locks.lock(key, ttl).await
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn unlock(&self, handle: &LockHandle) -> Result<bool> {
        self.ensure_running()?;
        self.inner.locks.unlock(handle).await
    }

    // ------------------------------------------------------------------
    // Geo
    // ------------------------------------------------------------------

    /// # Errors
    /// See [`GeospatialIndex::add`].
    pub async fn geo_add(&self, index: &str, points: &[GeoPoint]) -> Result<usize> {
        self.ensure_running()?;
        self.inner.geo.add(index, points).await
    }

    /// # Errors
    /// See [`GeospatialIndex::radius`].
    pub async fn geo_radius(
        &self,
        index: &str,
        longitude: f64,
        latitude: f64,
        radius: f64,
        unit: DistanceUnit,
    ) -> Result<Vec<GeoMatch>> {
        self.ensure_running()?;
        self.inner
            .geo
            .radius(index, longitude, latitude, radius, unit)
            .await
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn geo_pos(&self, index: &str, members: &[&str]) -> Result<Vec<GeoPoint>> {
        self.ensure_running()?;
        self.inner.geo.pos(index, members).await
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn geo_dist(
        &self,
        index: &str,
        member_a: &str,
        member_b: &str,
        unit: DistanceUnit,
    ) -> Result<Option<f64>> {
        self.ensure_running()?;
        self.inner.geo.dist(index, member_a, member_b, unit).await
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// # Errors
    /// `Error::EncodingError` if `message` cannot be encoded.
    pub fn publish<T: Serialize + ?Sized>(&self, channel: &str, message: &T) -> Result<usize> {
        self.ensure_running()?;
        self.inner.pubsub.publish(channel, message)
    }

    /// # Errors
    /// `Error::ValidationError` if `channels` is empty.
    pub fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        self.ensure_running()?;
        self.inner.pubsub.subscribe(channels)
    }

    /// # Errors
    /// `Error::ValidationError` if `patterns` is empty.
    pub fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription> {
        self.ensure_running()?;
        self.inner.pubsub.psubscribe(patterns)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Verify the backend is reachable within the operation deadline.
    ///
    /// # Errors
    /// Returns `Err` if backend is not accessible
    pub async fn health_check(&self) -> Result<bool> {
        self.inner
            .substrate
            .run("PING", self.inner.substrate.backend.health_check())
            .await
    }

    /// Close every subscription, stop background tasks and reject further
    /// calls, including calls made through component handles such as
    /// [`kv`](Self::kv) or [`entities`](Self::entities). Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.substrate.close();
        self.inner.pubsub.close_all();
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or(None);
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        info!("✓ Cache service shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl CacheService<InMemoryBackend> {
    /// Periodically purge expired entries until [`shutdown`](Self::shutdown).
    /// Replaces a sweeper started earlier. Must be called inside a Tokio runtime.
    pub fn start_expiry_sweeper(&self, interval: Duration) {
        let sweeper = self.inner.substrate.backend.start_expiry_sweeper(interval);
        if let Ok(mut slot) = self.inner.sweeper.lock() {
            *slot = Some(sweeper);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_is_clone_and_shares_state() {
        let cache = CacheService::new(InMemoryBackend::new());
        let clone = cache.clone();

        cache.set("k", &7u32, None).await.unwrap();
        assert_eq!(clone.get::<u32>("k").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_config_validates() {
        let config = CacheConfig::default().with_pubsub_capacity(0);
        assert!(matches!(
            CacheService::with_config(InMemoryBackend::new(), config),
            Err(Error::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_components_share_namespace() {
        let backend = InMemoryBackend::new();
        let config = CacheConfig::default().with_namespace("tenant-a");
        let cache = CacheService::with_config(backend.clone(), config).unwrap();

        cache.increment("c", 1, None).await.unwrap();
        let _handle = cache.lock("ride:1", Duration::from_secs(5)).await.unwrap();
        cache.entities().cache_ride("r1", &"ride").await;

        assert!(backend.exists("tenant-a:c").await.unwrap());
        assert!(backend.exists("tenant-a:lock:ride:1").await.unwrap());
        assert!(backend.exists("tenant-a:ride:r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_log_metrics() {
        let cache = CacheService::with_metrics(
            InMemoryBackend::new(),
            CacheConfig::default(),
            Arc::new(crate::observability::LogMetrics),
        )
        .unwrap();

        cache.set("k", &1u8, None).await.unwrap();
        assert_eq!(cache.get::<u8>("k").await.unwrap(), 1);
        assert!(cache.get::<u8>("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_health_check() {
        let cache = CacheService::new(InMemoryBackend::new());
        assert!(cache.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions_and_rejects_calls() {
        let cache = CacheService::new(InMemoryBackend::new());
        cache.start_expiry_sweeper(Duration::from_millis(50));
        let mut sub = cache.subscribe(&["ride:r-1"]).unwrap();
        let kv = cache.kv().clone();

        cache.shutdown().await;
        cache.shutdown().await;

        assert!(cache.is_shut_down());
        assert!(sub.is_closed());
        assert_eq!(sub.recv().await, None);
        assert!(matches!(
            cache.get::<u32>("k").await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(cache.publish("ride:r-1", &"x").is_err());

        // component handles, including ones cloned before shutdown
        assert!(matches!(
            kv.set("k", &1u32, None).await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(matches!(
            cache.kv().get::<u32>("k").await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(matches!(
            cache.geo().members("drivers:active").await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(matches!(
            cache.entities().get_cached_user::<String>("u-1").await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(matches!(
            cache.locks().lock("ride:r-1", Duration::from_secs(1)).await,
            Err(Error::BackendUnavailable(_))
        ));
    }
}
