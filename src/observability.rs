//! Metrics hooks and TTL policies.
//!
//! - [`CacheMetrics`] receives a callback for every key-value operation made
//!   through [`KeyValueStore`](crate::store::KeyValueStore). The default methods
//!   log through the `log` crate; [`NoOpMetrics`] discards everything.
//! - [`TtlPolicy`] decides how long an entity class stays cached. The entity
//!   facade uses [`TtlPolicy::PerType`] with [`entity_ttl`](crate::facade::entity_ttl)
//!   unless told otherwise.
//!
//! ```
//! use ride_cache::observability::TtlPolicy;
//! use std::time::Duration;
//!
//! let policy = TtlPolicy::PerType(|entity_type| match entity_type {
//!     "ride" => Duration::from_secs(1800),
//!     _ => Duration::from_secs(600),
//! });
//! assert_eq!(policy.get_ttl("ride"), Some(Duration::from_secs(1800)));
//! ```

use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// Record a cache miss.
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// Record a cache set operation.
    fn record_set(&self, key: &str, duration: Duration) {
        debug!("Cache SET: {} took {:?}", key, duration);
    }

    /// Record a cache delete operation.
    fn record_delete(&self, key: &str, duration: Duration) {
        debug!("Cache DELETE: {} took {:?}", key, duration);
    }

    /// Record an error.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Metrics sink that logs through the trait's default methods.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_set(&self, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _key: &str, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

/// TTL (Time-to-Live) policy for cache entries.
#[derive(Clone, Debug, Default)]
pub enum TtlPolicy {
    /// Use the store's configured default TTL
    #[default]
    Default,

    /// Fixed duration for all entries
    Fixed(Duration),

    /// Custom per-type policy
    PerType(fn(&str) -> Duration),
}

impl TtlPolicy {
    /// Get TTL for an entity type. `None` means "use the store default".
    pub fn get_ttl(&self, entity_type: &str) -> Option<Duration> {
        match self {
            TtlPolicy::Default => None,
            TtlPolicy::Fixed(d) => Some(*d),
            TtlPolicy::PerType(f) => Some(f(entity_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingMetrics {
        hits: AtomicUsize,
    }

    impl CacheMetrics for CountingMetrics {
        fn record_hit(&self, _key: &str, _duration: Duration) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_custom_metrics_override_single_hook() {
        let metrics = CountingMetrics::default();
        metrics.record_hit("user:1", Duration::from_micros(5));
        metrics.record_miss("user:2", Duration::from_micros(5));
        assert_eq!(metrics.hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_ttl_policy_default() {
        assert_eq!(TtlPolicy::Default.get_ttl("any"), None);
    }

    #[test]
    fn test_ttl_policy_fixed() {
        let policy = TtlPolicy::Fixed(Duration::from_secs(300));
        assert_eq!(policy.get_ttl("any"), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_ttl_policy_per_type() {
        let policy = TtlPolicy::PerType(|entity_type| match entity_type {
            "chat_room" => Duration::from_secs(900),
            _ => Duration::from_secs(1800),
        });

        assert_eq!(policy.get_ttl("chat_room"), Some(Duration::from_secs(900)));
        assert_eq!(policy.get_ttl("ride"), Some(Duration::from_secs(1800)));
    }
}
