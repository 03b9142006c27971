//! Entity cache facade.
//!
//! Maps the platform's domain entities onto the key-value store with fixed
//! key conventions and per-class TTLs:
//!
//! | Entity | Key | TTL |
//! |--------|-----|-----|
//! | user, driver, ride, payment | `{entity}:{id}` | 30 min |
//! | user permissions / profile | `user_permissions:{id}`, `user_profile:{id}` | 30 min |
//! | chat room | `chat_room:{id}` | 15 min |
//! | unread count | `unread_count_{id}` | 5 min |
//! | driver location | `driver_location:{id}` + member of the `drivers` geo index | 2 min |
//! | session | `session:{id}` | 24 h |
//!
//! Cache population and invalidation are write-path operations: failures are
//! logged and swallowed, because the durable store stays authoritative.
//! Invalidating an entity deletes all of its keys in one call and is
//! idempotent.

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::counter::AtomicCounter;
use crate::entity::{CacheEntity, DriverLocation};
use crate::error::Result;
use crate::geo::{DistanceUnit, GeoPoint, GeospatialIndex};
use crate::key::CacheKeyBuilder;
use crate::observability::TtlPolicy;
use crate::repository::DataRepository;
use crate::store::{KeyValueStore, Substrate};
use crate::strategy::CacheStrategy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Geo index holding every driver's last position.
pub const DRIVERS_INDEX: &str = "drivers";

const MINUTE: u64 = 60;

/// Per-class TTL used by the default [`TtlPolicy::PerType`] policy.
pub fn entity_ttl(entity_type: &str) -> Duration {
    match entity_type {
        "chat_room" => Duration::from_secs(15 * MINUTE),
        "unread_count" => Duration::from_secs(5 * MINUTE),
        "driver_location" => Duration::from_secs(2 * MINUTE),
        "session" => Duration::from_secs(24 * 60 * MINUTE),
        // user, driver, ride, payment and secondary user keys
        _ => Duration::from_secs(30 * MINUTE),
    }
}

/// Entity classes known to the facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    UserPermissions,
    UserProfile,
    Driver,
    DriverLocation,
    Ride,
    Payment,
    Session,
    ChatRoom,
    UnreadCount,
}

impl EntityKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::UserPermissions => "user_permissions",
            EntityKind::UserProfile => "user_profile",
            EntityKind::Driver => "driver",
            EntityKind::DriverLocation => "driver_location",
            EntityKind::Ride => "ride",
            EntityKind::Payment => "payment",
            EntityKind::Session => "session",
            EntityKind::ChatRoom => "chat_room",
            EntityKind::UnreadCount => "unread_count",
        }
    }

    /// Logical key for `id`.
    pub fn key(self, id: &str) -> String {
        match self {
            EntityKind::UnreadCount => format!("unread_count_{}", id),
            other => CacheKeyBuilder::build_with_prefix(other.prefix(), &id),
        }
    }

    /// Every key belonging to an entity of this class.
    fn related(self) -> &'static [EntityKind] {
        match self {
            EntityKind::User => &[
                EntityKind::User,
                EntityKind::UserPermissions,
                EntityKind::UserProfile,
            ],
            EntityKind::Driver => &[EntityKind::Driver, EntityKind::DriverLocation],
            EntityKind::UserPermissions => &[EntityKind::UserPermissions],
            EntityKind::UserProfile => &[EntityKind::UserProfile],
            EntityKind::DriverLocation => &[EntityKind::DriverLocation],
            EntityKind::Ride => &[EntityKind::Ride],
            EntityKind::Payment => &[EntityKind::Payment],
            EntityKind::Session => &[EntityKind::Session],
            EntityKind::ChatRoom => &[EntityKind::ChatRoom],
            EntityKind::UnreadCount => &[EntityKind::UnreadCount],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A radius hit whose position is still fresh.
#[derive(Clone, Debug, PartialEq)]
pub struct NearbyDriver {
    pub location: DriverLocation,
    /// Distance from the search center, in the unit of the query.
    pub distance: f64,
}

/// Domain-level cache helpers.
#[derive(Clone)]
pub struct EntityCache<B: CacheBackend> {
    store: KeyValueStore<B>,
    counters: AtomicCounter<B>,
    geo: GeospatialIndex<B>,
    ttl_policy: TtlPolicy,
}

impl<B: CacheBackend> EntityCache<B> {
    pub fn new(backend: B, config: &CacheConfig) -> Self {
        Self::from_substrate(Substrate::new(backend, config), config.default_ttl)
    }

    pub(crate) fn from_substrate(substrate: Substrate<B>, default_ttl: Duration) -> Self {
        EntityCache {
            store: KeyValueStore::from_substrate(substrate.clone(), default_ttl),
            counters: AtomicCounter::from_substrate(substrate.clone()),
            geo: GeospatialIndex::from_substrate(substrate),
            ttl_policy: TtlPolicy::PerType(entity_ttl),
        }
    }

    /// Set custom TTL policy.
    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl_policy = policy;
        self
    }

    /// TTL for an entity class. `None` means the store default.
    pub fn ttl_for(&self, kind: EntityKind) -> Option<Duration> {
        self.ttl_policy.get_ttl(kind.prefix())
    }

    // ------------------------------------------------------------------
    // Generic helpers
    // ------------------------------------------------------------------

    /// Cache `value` as `kind:{id}`. Failures are logged, not returned.
    pub async fn cache<T: Serialize + ?Sized>(&self, kind: EntityKind, id: &str, value: &T) {
        let key = kind.key(id);
        if let Err(e) = self.store.set(&key, value, self.ttl_for(kind)).await {
            warn!("⚠ Failed to cache {}: {}", key, e);
        }
    }

    /// # Errors
    /// `Error::NotFound` on a miss; decoding and backend errors otherwise.
    pub async fn get_cached<T: DeserializeOwned>(&self, kind: EntityKind, id: &str) -> Result<T> {
        self.store.get(&kind.key(id)).await
    }

    /// Delete every key of the entity. Failures are logged, not returned.
    pub async fn invalidate(&self, kind: EntityKind, id: &str) {
        let keys: Vec<String> = kind.related().iter().map(|k| k.key(id)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();

        match self.store.delete(&refs).await {
            Ok(()) => debug!("✓ Invalidated {} {} ({} keys)", kind, id, keys.len()),
            Err(e) => warn!("⚠ Failed to invalidate {} {}: {}", kind, id, e),
        }
        if kind == EntityKind::Driver || kind == EntityKind::DriverLocation {
            if let Err(e) = self.geo.remove(DRIVERS_INDEX, id).await {
                warn!("⚠ Failed to remove driver {} from {}: {}", id, DRIVERS_INDEX, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn cache_user<T: Serialize + ?Sized>(&self, id: &str, user: &T) {
        self.cache(EntityKind::User, id, user).await
    }

    /// # Errors
    /// `Error::NotFound` on a miss.
    pub async fn get_cached_user<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        self.get_cached(EntityKind::User, id).await
    }

    pub async fn cache_user_permissions<T: Serialize + ?Sized>(&self, id: &str, permissions: &T) {
        self.cache(EntityKind::UserPermissions, id, permissions).await
    }

    /// # Errors
    /// `Error::NotFound` on a miss.
    pub async fn get_cached_user_permissions<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        self.get_cached(EntityKind::UserPermissions, id).await
    }

    pub async fn cache_user_profile<T: Serialize + ?Sized>(&self, id: &str, profile: &T) {
        self.cache(EntityKind::UserProfile, id, profile).await
    }

    /// # Errors
    /// `Error::NotFound` on a miss.
    pub async fn get_cached_user_profile<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        self.get_cached(EntityKind::UserProfile, id).await
    }

    /// Drops the user, permissions and profile keys.
    pub async fn invalidate_user(&self, id: &str) {
        self.invalidate(EntityKind::User, id).await
    }

    // ------------------------------------------------------------------
    // Drivers
    // ------------------------------------------------------------------

    pub async fn cache_driver<T: Serialize + ?Sized>(&self, id: &str, driver: &T) {
        self.cache(EntityKind::Driver, id, driver).await
    }

    /// # Errors
    /// `Error::NotFound` on a miss.
    pub async fn get_cached_driver<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        self.get_cached(EntityKind::Driver, id).await
    }

    /// Drops the driver record, its location key and its index entry.
    pub async fn invalidate_driver(&self, id: &str) {
        self.invalidate(EntityKind::Driver, id).await
    }

    // ------------------------------------------------------------------
    // Rides, payments, sessions, chat
    // ------------------------------------------------------------------

    pub async fn cache_ride<T: Serialize + ?Sized>(&self, id: &str, ride: &T) {
        self.cache(EntityKind::Ride, id, ride).await
    }

    /// # Errors
    /// `Error::NotFound` on a miss.
    pub async fn get_cached_ride<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        self.get_cached(EntityKind::Ride, id).await
    }

    pub async fn invalidate_ride(&self, id: &str) {
        self.invalidate(EntityKind::Ride, id).await
    }

    pub async fn cache_payment<T: Serialize + ?Sized>(&self, id: &str, payment: &T) {
        self.cache(EntityKind::Payment, id, payment).await
    }

    /// # Errors
    /// `Error::NotFound` on a miss.
    pub async fn get_cached_payment<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        self.get_cached(EntityKind::Payment, id).await
    }

    pub async fn invalidate_payment(&self, id: &str) {
        self.invalidate(EntityKind::Payment, id).await
    }

    pub async fn cache_session<T: Serialize + ?Sized>(&self, session_id: &str, session: &T) {
        self.cache(EntityKind::Session, session_id, session).await
    }

    /// # Errors
    /// `Error::NotFound` if the session is unknown or expired.
    pub async fn get_session<T: DeserializeOwned>(&self, session_id: &str) -> Result<T> {
        self.get_cached(EntityKind::Session, session_id).await
    }

    pub async fn invalidate_session(&self, session_id: &str) {
        self.invalidate(EntityKind::Session, session_id).await
    }

    pub async fn cache_chat_room<T: Serialize + ?Sized>(&self, id: &str, room: &T) {
        self.cache(EntityKind::ChatRoom, id, room).await
    }

    /// # Errors
    /// `Error::NotFound` on a miss.
    pub async fn get_cached_chat_room<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        self.get_cached(EntityKind::ChatRoom, id).await
    }

    pub async fn invalidate_chat_room(&self, id: &str) {
        self.invalidate(EntityKind::ChatRoom, id).await
    }

    // ------------------------------------------------------------------
    // Unread counts
    // ------------------------------------------------------------------

    /// Add `delta` to a user's unread count. A new count lives for the
    /// unread-count TTL.
    ///
    /// # Errors
    /// Backend errors, or `Error::EncodingError` if the key holds a non-counter.
    pub async fn increment_unread_count(&self, id: &str, delta: i64) -> Result<i64> {
        self.counters
            .increment(
                &EntityKind::UnreadCount.key(id),
                delta,
                self.ttl_for(EntityKind::UnreadCount),
            )
            .await
    }

    /// Cached unread count; `0` when absent.
    ///
    /// # Errors
    /// Backend errors, or `Error::EncodingError` if the key holds a non-counter.
    pub async fn get_unread_count(&self, id: &str) -> Result<i64> {
        self.counters.get(&EntityKind::UnreadCount.key(id)).await
    }

    pub async fn invalidate_unread_count(&self, id: &str) {
        self.invalidate(EntityKind::UnreadCount, id).await
    }

    // ------------------------------------------------------------------
    // Driver locations
    // ------------------------------------------------------------------

    /// Record a driver's position in the `drivers` index and refresh its
    /// TTL'd companion key. The companion is written first; stale-driver
    /// pruning depends on that order.
    ///
    /// # Errors
    /// `Error::ValidationError` for an out-of-range coordinate or empty id;
    /// backend errors otherwise.
    pub async fn update_driver_location(&self, location: &DriverLocation) -> Result<()> {
        location.validate()?;
        let point = GeoPoint::new(&location.driver_id, location.longitude, location.latitude)?;

        self.store
            .set(
                &EntityKind::DriverLocation.key(&location.driver_id),
                location,
                self.ttl_for(EntityKind::DriverLocation),
            )
            .await?;
        self.geo.add(DRIVERS_INDEX, &[point]).await?;
        debug!(
            "✓ Driver {} at ({}, {})",
            location.driver_id, location.longitude, location.latitude
        );
        Ok(())
    }

    /// # Errors
    /// `Error::NotFound` if the driver has no fresh position.
    pub async fn get_driver_location(&self, driver_id: &str) -> Result<DriverLocation> {
        self.store
            .get(&EntityKind::DriverLocation.key(driver_id))
            .await
    }

    /// Drivers with a fresh position within `radius` of the point, nearest first.
    ///
    /// Index members whose companion key has expired are skipped and removed
    /// from the index. `limit` caps the number of results.
    ///
    /// # Errors
    /// `Error::ValidationError` for an invalid center or radius; backend errors.
    pub async fn nearby_drivers(
        &self,
        longitude: f64,
        latitude: f64,
        radius: f64,
        unit: DistanceUnit,
        limit: Option<usize>,
    ) -> Result<Vec<NearbyDriver>> {
        let hits = self
            .geo
            .radius(DRIVERS_INDEX, longitude, latitude, radius, unit)
            .await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = hits
            .iter()
            .map(|hit| EntityKind::DriverLocation.key(&hit.member))
            .collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let locations: Vec<Option<DriverLocation>> = self.store.get_many(&refs).await?;

        let mut nearby = Vec::with_capacity(hits.len());
        for (hit, location) in hits.into_iter().zip(locations) {
            match location {
                Some(location) => nearby.push(NearbyDriver {
                    location,
                    distance: hit.distance,
                }),
                None => {
                    if let Err(e) = self.prune_driver(&hit.member).await {
                        warn!("⚠ Failed to prune stale driver {}: {}", hit.member, e);
                    }
                }
            }
        }
        if let Some(limit) = limit {
            nearby.truncate(limit);
        }
        Ok(nearby)
    }

    /// Drop `driver_id` from the index unless its companion key is live.
    ///
    /// An update may land at any point during pruning. Updates write the
    /// companion before the index member, so the companion is checked both
    /// before and after the removal; a companion seen afterwards puts its
    /// position back.
    async fn prune_driver(&self, driver_id: &str) -> Result<()> {
        let companion = EntityKind::DriverLocation.key(driver_id);
        if self.store.exists(&companion).await? {
            debug!("Driver {} refreshed since the search, keeping it", driver_id);
            return Ok(());
        }

        debug!("Driver {} position is stale, removing from index", driver_id);
        self.geo.remove(DRIVERS_INDEX, driver_id).await?;

        match self.store.get::<DriverLocation>(&companion).await {
            Ok(location) => {
                debug!("Driver {} refreshed during pruning, restoring", driver_id);
                let point = GeoPoint::new(driver_id, location.longitude, location.latitude)?;
                self.geo.add(DRIVERS_INDEX, &[point]).await?;
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Take a driver off the map.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn remove_driver_location(&self, driver_id: &str) -> Result<()> {
        self.store
            .delete(&[&EntityKind::DriverLocation.key(driver_id)])
            .await?;
        self.geo.remove(DRIVERS_INDEX, driver_id).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-through
    // ------------------------------------------------------------------

    /// Read `T` with `id` according to `strategy`, loading from `repository`
    /// on a miss and repopulating the cache.
    ///
    /// Unreadable cache entries (wrong shape, old schema) and an unavailable
    /// cache are treated as misses. Repopulation failures are logged only.
    ///
    /// # Errors
    /// Returns repository errors, entity validation errors, and cache errors
    /// that do not mean "treat as miss".
    pub async fn fetch<T, R>(
        &self,
        id: &T::Key,
        repository: &R,
        strategy: CacheStrategy,
    ) -> Result<Option<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        let key = CacheKeyBuilder::build::<T>(id);
        debug!("» Cache fetch for key: {} (strategy: {})", key, strategy);

        if strategy == CacheStrategy::Invalidate {
            if let Err(e) = self.store.delete(&[&key]).await {
                warn!("⚠ Failed to invalidate {}: {}", key, e);
            }
        }

        if strategy.reads_cache() {
            if let Some(entity) = self.read_cached::<T>(&key).await? {
                entity.validate()?;
                return Ok(Some(entity));
            }
        }

        if !strategy.loads_from_repository() {
            return Ok(None);
        }

        debug!("Cache miss for {}, loading from repository", key);
        let loaded = repository.fetch_by_id(id).await?;
        if let Some(entity) = &loaded {
            entity.validate()?;
            let ttl = self.ttl_policy.get_ttl(T::cache_prefix());
            match entity.serialize_for_cache() {
                Ok(bytes) => {
                    if let Err(e) = self.store.set_raw(&key, bytes, ttl).await {
                        warn!("⚠ Failed to repopulate {}: {}", key, e);
                    }
                }
                Err(e) => warn!("⚠ Failed to encode {} for caching: {}", key, e),
            }
        }
        Ok(loaded)
    }

    async fn read_cached<T: CacheEntity>(&self, key: &str) -> Result<Option<T>> {
        let bytes = match self.store.get_raw(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) if e.should_fall_back() => {
                warn!("⚠ Cache unavailable for {}: {}", key, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match T::deserialize_from_cache(&bytes) {
            Ok(entity) => Ok(Some(entity)),
            Err(e) if e.is_encoding() => {
                warn!("⚠ Evicting unreadable entry {}: {}", key, e);
                if let Err(e) = self.store.delete(&[key]).await {
                    warn!("⚠ Failed to evict {}: {}", key, e);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Underlying store, for keys outside the entity conventions.
    pub fn store(&self) -> &KeyValueStore<B> {
        &self.store
    }
}
