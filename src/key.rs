//! Cache key management utilities.
//!
//! Every key that reaches a backend has the shape `{namespace}:{logical key}`.
//! Logical keys follow fixed conventions so that other deployments reading
//! the same store agree on them:
//!
//! ```text
//! {entity}:{id}        user:42, ride:r-17, driver_location:d-3
//! lock:{key}           distributed locks
//! rate_limit:{key}     fixed-window counters
//! session:{id}         sessions
//! ```

use crate::entity::CacheEntity;
use std::fmt::Display;
use std::sync::Arc;

/// Separator between key segments.
pub const SEPARATOR: char = ':';

/// Prefix for distributed lock keys.
pub const LOCK_PREFIX: &str = "lock";

/// Prefix for rate limit counters.
pub const RATE_LIMIT_PREFIX: &str = "rate_limit";

/// Builder for logical (not yet namespaced) cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Build full cache key from entity type and ID.
    pub fn build<T: CacheEntity>(id: &T::Key) -> String {
        format!("{}:{}", T::cache_prefix(), id)
    }

    /// Build cache key with custom prefix.
    pub fn build_with_prefix(prefix: &str, id: &dyn Display) -> String {
        format!("{}:{}", prefix, id)
    }

    /// Build composite key from multiple parts.
    pub fn build_composite(parts: &[&str]) -> String {
        parts.join(":")
    }

    /// `lock:{key}`
    pub fn lock(key: &str) -> String {
        Self::build_with_prefix(LOCK_PREFIX, &key)
    }

    /// `rate_limit:{key}`
    pub fn rate_limit(key: &str) -> String {
        Self::build_with_prefix(RATE_LIMIT_PREFIX, &key)
    }

    /// Parse a composite key into parts.
    pub fn parse(key: &str) -> Vec<&str> {
        key.split(SEPARATOR).collect()
    }
}

/// Namespace applied to every key before it reaches the backend.
///
/// Logically distinct deployments sharing one store never collide as long as
/// their namespaces differ. Cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keyspace {
    namespace: Arc<str>,
}

impl Keyspace {
    pub fn new(namespace: impl AsRef<str>) -> Self {
        Keyspace {
            namespace: Arc::from(namespace.as_ref()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix `key` with the namespace. An empty namespace leaves it untouched.
    pub fn namespaced(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}{}{}", self.namespace, SEPARATOR, key)
        }
    }

    /// Inverse of [`namespaced`](Self::namespaced). Returns `None` for keys
    /// belonging to another namespace.
    pub fn strip<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        if self.namespace.is_empty() {
            return Some(full_key);
        }
        full_key
            .strip_prefix(&*self.namespace)
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Keyspace::new("")
    }
}
