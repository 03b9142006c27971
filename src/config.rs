//! Service configuration.
//!
//! [`CacheConfig`] is built once at startup and handed to
//! [`CacheService`](crate::CacheService). Every field has a default, and
//! [`CacheConfig::from_env`] overrides them from the process environment:
//!
//! | Variable | Field | Unit |
//! |----------|-------|------|
//! | `CACHE_NAMESPACE` | `namespace` | string |
//! | `CACHE_DEFAULT_TTL_SECS` | `default_ttl` | seconds |
//! | `CACHE_OPERATION_TIMEOUT_MS` | `operation_timeout` | milliseconds, `0` disables |
//! | `CACHE_PUBSUB_CAPACITY` | `pubsub_capacity` | messages buffered per channel |

use crate::error::{Error, Result};
use std::str::FromStr;
use std::time::Duration;

/// TTL applied to `set` calls that pass no TTL (or a zero TTL).
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Upper bound on a single store round-trip before the call fails with `Timeout`.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Messages buffered per channel for each subscriber before the oldest is dropped.
pub const DEFAULT_PUBSUB_CAPACITY: usize = 1024;

/// Upper bound for [`CacheConfig::pubsub_capacity`].
pub const MAX_PUBSUB_CAPACITY: usize = 1 << 20;

/// Configuration for the coordination layer.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Prefix applied to every key (`{namespace}:{key}`). Empty disables prefixing.
    pub namespace: String,
    /// Process-wide default TTL.
    pub default_ttl: Duration,
    /// Per-operation deadline. `None` leaves cancellation entirely to the caller.
    pub operation_timeout: Option<Duration>,
    /// Per-channel buffer of each pub/sub subscriber.
    pub pubsub_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            namespace: "ride".to_string(),
            default_ttl: DEFAULT_TTL,
            operation_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            pubsub_capacity: DEFAULT_PUBSUB_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Build a configuration from defaults overridden by `CACHE_*` variables.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is set but unparsable, or if
    /// the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        let mut config = CacheConfig::default();

        if let Ok(namespace) = std::env::var("CACHE_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(secs) = env_number::<u64>("CACHE_DEFAULT_TTL_SECS")? {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = env_number::<u64>("CACHE_OPERATION_TIMEOUT_MS")? {
            config.operation_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(capacity) = env_number::<usize>("CACHE_PUBSUB_CAPACITY")? {
            config.pubsub_capacity = capacity;
        }

        config.validate()?;
        info!(
            "✓ Cache config loaded (namespace: {:?}, default TTL: {:?})",
            config.namespace, config.default_ttl
        );
        Ok(config)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_pubsub_capacity(mut self, capacity: usize) -> Self {
        self.pubsub_capacity = capacity;
        self
    }

    /// Check invariants the rest of the crate relies on.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(Error::ConfigError(
                "default_ttl must be greater than zero".to_string(),
            ));
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::ConfigError(
                "operation_timeout must be greater than zero when set".to_string(),
            ));
        }
        if self.pubsub_capacity == 0 || self.pubsub_capacity > MAX_PUBSUB_CAPACITY {
            return Err(Error::ConfigError(format!(
                "pubsub_capacity must be between 1 and {}",
                MAX_PUBSUB_CAPACITY
            )));
        }
        if self.namespace.ends_with(':') {
            return Err(Error::ConfigError(format!(
                "namespace {:?} must not end with ':'",
                self.namespace
            )));
        }
        Ok(())
    }
}

fn env_number<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::ConfigError(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}
