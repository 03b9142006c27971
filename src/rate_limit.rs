//! Fixed-window rate limiting.
//!
//! Each window is a counter under `rate_limit:{key}` whose TTL is set when the
//! first request of the window creates it. Requests are counted even when
//! denied. Bursts of up to twice the limit straddling a window boundary are
//! accepted.

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::store::Substrate;
use std::time::{Duration, SystemTime};

/// Outcome of a rate limit check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitResult {
    /// `count <= limit`
    pub allowed: bool,
    /// Requests seen in the current window, this one included.
    pub count: u64,
    pub limit: u64,
    /// `limit - count`, floored at zero.
    pub remaining: u64,
    /// `now + window` at the time of the check.
    pub reset_at: SystemTime,
    /// Time until the window ends when denied; zero when allowed.
    pub retry_after: Duration,
}

/// Fixed-window request limiter.
///
/// # Example
///
/// ```
/// use ride_cache::backend::InMemoryBackend;
/// use ride_cache::config::CacheConfig;
/// use ride_cache::rate_limit::RateLimiter;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> ride_cache::Result<()> {
/// let limiter = RateLimiter::new(InMemoryBackend::new(), &CacheConfig::default());
///
/// let first = limiter.check("login:10.0.0.1", 1, Duration::from_secs(60)).await?;
/// assert!(first.allowed);
/// let second = limiter.check("login:10.0.0.1", 1, Duration::from_secs(60)).await?;
/// assert!(!second.allowed);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter<B: CacheBackend> {
    substrate: Substrate<B>,
}

impl<B: CacheBackend> RateLimiter<B> {
    pub fn new(backend: B, config: &CacheConfig) -> Self {
        RateLimiter {
            substrate: Substrate::new(backend, config),
        }
    }

    pub(crate) fn from_substrate(substrate: Substrate<B>) -> Self {
        RateLimiter { substrate }
    }

    /// Count one request against `key` and report whether it is allowed.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for a zero window,
    /// `Error::EncodingError` if the window counter was driven below one by
    /// some other writer, or a backend error. A denial is an ordinary `Ok`
    /// result.
    pub async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitResult> {
        if window.is_zero() {
            return Err(Error::ValidationError(
                "rate limit window must be greater than zero".to_string(),
            ));
        }
        let full_key = self.substrate.key(&CacheKeyBuilder::rate_limit(key));
        let now = SystemTime::now();

        let count = self
            .substrate
            .run(
                "INCRBY",
                self.substrate.backend.incr_by(&full_key, 1, Some(window)),
            )
            .await?;
        // incrementing by one can only land below one if something else
        // decremented the window counter
        let count = match u64::try_from(count) {
            Ok(count) if count >= 1 => count,
            _ => {
                error!(
                    "✗ Rate limit counter {} holds {} after increment",
                    full_key, count
                );
                return Err(Error::EncodingError(format!(
                    "rate limit counter {} is not a request count: {}",
                    full_key, count
                )));
            }
        };
        let allowed = count <= limit;

        let retry_after = if allowed {
            Duration::ZERO
        } else {
            self.remaining_window(&full_key, window).await?
        };

        if !allowed {
            debug!(
                "Rate limit exceeded for {} ({}/{}), retry after {:?}",
                key, count, limit, retry_after
            );
        }

        Ok(RateLimitResult {
            allowed,
            count,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: now + window,
            retry_after,
        })
    }

    /// Forget the current window for `key`.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn reset(&self, key: &str) -> Result<()> {
        let full_key = self.substrate.key(&CacheKeyBuilder::rate_limit(key));
        self.substrate
            .run("DEL", self.substrate.backend.delete(&full_key))
            .await
    }

    /// TTL of the window counter. A counter that lost its expiry gets a fresh
    /// window so it cannot block the key forever.
    async fn remaining_window(&self, full_key: &str, window: Duration) -> Result<Duration> {
        let ttl = self
            .substrate
            .run("TTL", self.substrate.backend.ttl(full_key))
            .await?;
        match ttl {
            Some(remaining) => Ok(remaining),
            None => {
                warn!("⚠ Rate limit counter {} had no expiry, resetting window", full_key);
                self.substrate
                    .run("EXPIRE", self.substrate.backend.expire(full_key, window))
                    .await?;
                Ok(window)
            }
        }
    }
}
