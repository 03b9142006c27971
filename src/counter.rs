//! Atomic integer counters.
//!
//! Counters are stored as ASCII decimal under their namespaced key. The
//! optional TTL is applied exactly once, when an increment creates the key;
//! later increments never move the expiry.

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::serialization::decode_counter;
use crate::store::Substrate;
use std::time::Duration;

/// Per-key atomic counters.
#[derive(Clone)]
pub struct AtomicCounter<B: CacheBackend> {
    substrate: Substrate<B>,
}

impl<B: CacheBackend> AtomicCounter<B> {
    pub fn new(backend: B, config: &CacheConfig) -> Self {
        AtomicCounter {
            substrate: Substrate::new(backend, config),
        }
    }

    pub(crate) fn from_substrate(substrate: Substrate<B>) -> Self {
        AtomicCounter { substrate }
    }

    /// Add `delta` and return the new value.
    ///
    /// `ttl` is set only if this call creates the counter. A `None` or zero
    /// `ttl` leaves a new counter without expiry.
    ///
    /// # Errors
    /// Returns `Error::EncodingError` if the key holds a non-integer value,
    /// `Error::ValidationError` on overflow, or a backend error.
    pub async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let full_key = self.substrate.key(key);
        let ttl = ttl.filter(|d| !d.is_zero());
        self.substrate
            .run("INCRBY", self.substrate.backend.incr_by(&full_key, delta, ttl))
            .await
    }

    /// Subtract `delta` and return the new value. Counters may go negative.
    ///
    /// # Errors
    /// Same as [`increment`](Self::increment).
    pub async fn decrement(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        self.increment(key, delta.saturating_neg(), ttl).await
    }

    /// Current value; `0` if the counter does not exist.
    ///
    /// # Errors
    /// Returns `Error::EncodingError` if the key holds a non-integer value.
    pub async fn get(&self, key: &str) -> Result<i64> {
        let full_key = self.substrate.key(key);
        let raw = self
            .substrate
            .run("GET", self.substrate.backend.get(&full_key))
            .await?;
        match raw {
            Some(bytes) => decode_counter(&bytes),
            None => Ok(0),
        }
    }

    /// Remaining lifetime of the counter's window.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("TTL", self.substrate.backend.ttl(&full_key))
            .await
    }

    /// Set the expiry of an existing counter. Returns `false` if it does not exist.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("EXPIRE", self.substrate.backend.expire(&full_key, ttl))
            .await
    }

    /// Delete the counter.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn reset(&self, key: &str) -> Result<()> {
        let full_key = self.substrate.key(key);
        self.substrate
            .run("DEL", self.substrate.backend.delete(&full_key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn counter() -> AtomicCounter<InMemoryBackend> {
        AtomicCounter::new(InMemoryBackend::new(), &CacheConfig::default())
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let counter = counter();
        assert_eq!(counter.get("unread_count_u1").await.unwrap(), 0);
        assert_eq!(counter.increment("unread_count_u1", 3, None).await.unwrap(), 3);
        assert_eq!(counter.decrement("unread_count_u1", 5, None).await.unwrap(), -2);
        assert_eq!(counter.get("unread_count_u1").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_ttl_set_once() {
        let counter = counter();
        counter
            .increment("w", 1, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        counter
            .increment("w", 1, Some(Duration::from_secs(100)))
            .await
            .unwrap();

        let ttl = counter.ttl("w").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_zero_ttl_means_no_expiry() {
        let counter = counter();
        counter.increment("z", 1, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(counter.ttl("z").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset() {
        let counter = counter();
        counter.increment("r", 9, None).await.unwrap();
        counter.reset("r").await.unwrap();
        assert_eq!(counter.get("r").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_sum_exactly() {
        let counter = counter();
        let mut handles = vec![];

        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..125 {
                    counter.increment("hits", 1, None).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.get("hits").await.unwrap(), 1000);
    }
}
