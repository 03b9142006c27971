//! Advisory distributed locks.
//!
//! A lock is a `lock:{key}` entry holding a random owner token, written with a
//! single atomic set-if-absent and a TTL. Releasing compares the stored token
//! with the handle's token and deletes only on a match, so a holder whose lock
//! already expired can never release someone else's lock. A crashed holder's
//! lock frees itself when the TTL runs out.
//!
//! Locks are advisory: nothing stops code that never asks for the lock.

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::store::Substrate;
use std::future::Future;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Proof of ownership returned by a successful acquire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
    ttl: Duration,
    acquired_at: SystemTime,
}

impl LockHandle {
    /// Logical key the lock protects (without the `lock:` prefix).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn acquired_at(&self) -> SystemTime {
        self.acquired_at
    }

    /// `true` once the TTL has elapsed since acquisition, judged by the local clock.
    pub fn is_expired(&self) -> bool {
        self.acquired_at
            .elapsed()
            .map(|elapsed| elapsed >= self.ttl)
            .unwrap_or(false)
    }
}

/// Mutual exclusion over the shared store.
///
/// # Example
///
/// ```
/// use ride_cache::backend::InMemoryBackend;
/// use ride_cache::config::CacheConfig;
/// use ride_cache::lock::DistributedLock;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> ride_cache::Result<()> {
/// let locks = DistributedLock::new(InMemoryBackend::new(), &CacheConfig::default());
///
/// let handle = locks.lock("ride:r-1", Duration::from_secs(10)).await?;
/// assert!(locks.lock("ride:r-1", Duration::from_secs(10)).await.is_err());
/// assert!(locks.unlock(&handle).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DistributedLock<B: CacheBackend> {
    substrate: Substrate<B>,
}

impl<B: CacheBackend> DistributedLock<B> {
    pub fn new(backend: B, config: &CacheConfig) -> Self {
        DistributedLock {
            substrate: Substrate::new(backend, config),
        }
    }

    pub(crate) fn from_substrate(substrate: Substrate<B>) -> Self {
        DistributedLock { substrate }
    }

    fn lock_key(&self, key: &str) -> String {
        self.substrate.key(&CacheKeyBuilder::lock(key))
    }

    /// Try once to acquire `key` for `ttl`.
    ///
    /// # Errors
    /// - `Error::LockHeld`: another holder owns a live lock on `key`
    /// - `Error::ValidationError`: zero `ttl`
    /// - `Error::Timeout` / backend errors. A timed-out attempt deletes its
    ///   own token if it did land, so it never leaves an orphaned lock.
    pub async fn lock(&self, key: &str, ttl: Duration) -> Result<LockHandle> {
        if ttl.is_zero() {
            return Err(Error::ValidationError(
                "lock ttl must be greater than zero".to_string(),
            ));
        }
        let full_key = self.lock_key(key);
        let token = Uuid::new_v4().to_string();

        let acquired = self
            .substrate
            .run(
                "SETNX",
                self.substrate
                    .backend
                    .set_nx(&full_key, token.as_bytes().to_vec(), Some(ttl)),
            )
            .await;

        match acquired {
            Ok(true) => {
                debug!("✓ Lock acquired {} (TTL: {:?})", full_key, ttl);
                Ok(LockHandle {
                    key: key.to_string(),
                    token,
                    ttl,
                    acquired_at: SystemTime::now(),
                })
            }
            Ok(false) => {
                debug!("Lock {} is held by another owner", full_key);
                Err(Error::LockHeld(key.to_string()))
            }
            Err(e @ Error::Timeout(_)) => {
                let cleanup = self
                    .substrate
                    .run(
                        "CAD",
                        self.substrate
                            .backend
                            .compare_and_delete(&full_key, token.as_bytes()),
                    )
                    .await;
                if let Err(cleanup_err) = cleanup {
                    warn!(
                        "⚠ Could not clear token of timed-out lock {}: {}",
                        full_key, cleanup_err
                    );
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Release a lock. Returns `false` if the handle no longer owns it
    /// (expired and possibly re-acquired by someone else).
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn unlock(&self, handle: &LockHandle) -> Result<bool> {
        let full_key = self.lock_key(&handle.key);
        let released = self
            .substrate
            .run(
                "CAD",
                self.substrate
                    .backend
                    .compare_and_delete(&full_key, handle.token.as_bytes()),
            )
            .await?;
        if released {
            debug!("✓ Lock released {}", full_key);
        } else {
            debug!("Lock {} was no longer owned by this handle", full_key);
        }
        Ok(released)
    }

    /// Acquire with up to `attempts` tries, sleeping `backoff`, `2 * backoff`,
    /// `4 * backoff`, ... between them.
    ///
    /// # Errors
    /// Returns `Error::LockHeld` once every attempt found the lock taken.
    /// Other errors are returned immediately.
    pub async fn lock_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        attempts: u32,
        backoff: Duration,
    ) -> Result<LockHandle> {
        let max_attempts = attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.lock(key, ttl).await {
                Err(Error::LockHeld(_)) if attempt < max_attempts => {
                    debug!(
                        "Lock {} busy (attempt {}/{}), retrying...",
                        key, attempt, max_attempts
                    );
                    let factor = 2_u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff.saturating_mul(factor)).await;
                }
                other => return other,
            }
        }
    }

    /// Run `f` while holding `key`, releasing the lock afterwards whether `f`
    /// succeeded or not.
    ///
    /// # Errors
    /// Returns `Error::LockHeld` if the lock is taken, otherwise whatever `f` returns.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.lock(key, ttl).await?;
        let result = f().await;

        match self.unlock(&handle).await {
            Ok(true) => {}
            Ok(false) => warn!(
                "⚠ Lock {} expired before the critical section finished",
                key
            ),
            Err(e) => warn!("⚠ Failed to release lock {}: {}", key, e),
        }
        result
    }

    /// `true` if a live lock exists on `key`.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        let full_key = self.lock_key(key);
        self.substrate
            .run("EXISTS", self.substrate.backend.exists(&full_key))
            .await
    }
}
