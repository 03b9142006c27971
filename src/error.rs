//! Error types for the coordination layer.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the coordination layer.
///
/// Callers are expected to branch on a handful of categories rather than on
/// every variant; see [`Error::should_fall_back`] and [`Error::is_encoding`].
#[derive(Debug, Clone)]
pub enum Error {
    /// Key absent or expired.
    ///
    /// Recoverable: the caller falls back to the source of truth and may
    /// repopulate the cache.
    NotFound,

    /// A value could not be encoded to or decoded from cache bytes.
    ///
    /// Non-recoverable for the call that produced it. The value is never
    /// silently dropped or truncated.
    EncodingError(String),

    /// Cache entry header is invalid (bad magic or foreign data under the key).
    ///
    /// **Recovery:** Evict the entry and recompute.
    InvalidCacheEntry(String),

    /// Schema version mismatch between code and cached data.
    ///
    /// Expected during deployments that change a cached type.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from cached entry)
        found: u32,
    },

    /// Lock contention: another holder owns the lock.
    ///
    /// The caller must retry or abandon, never proceed as if it held the lock.
    LockHeld(String),

    /// Underlying store unreachable or returned a protocol error.
    ///
    /// The caller must treat the cache as absent and use durable storage.
    BackendUnavailable(String),

    /// Operation against a key holding a different kind of value
    /// (e.g. a list command on a geo index).
    WrongType(String),

    /// Operation exceeded the configured deadline.
    Timeout(String),

    /// Caller supplied invalid input (coordinates out of range, empty key, ...).
    ValidationError(String),

    /// Invalid configuration during construction.
    ConfigError(String),

    /// Durable repository failed while loading on a cache miss.
    RepositoryError(String),

    /// Feature not available on this backend or not compiled in.
    NotImplemented(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// `true` for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// `true` for every variant that means "these bytes are not a value of that type".
    pub fn is_encoding(&self) -> bool {
        matches!(
            self,
            Error::EncodingError(_) | Error::InvalidCacheEntry(_) | Error::VersionMismatch { .. }
        )
    }

    /// `true` when the caller should treat the cache as absent and read the
    /// durable store instead.
    pub fn should_fall_back(&self) -> bool {
        matches!(
            self,
            Error::NotFound | Error::BackendUnavailable(_) | Error::Timeout(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "Key not found"),
            Error::EncodingError(msg) => write!(f, "Encoding error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "Invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Cache version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::LockHeld(key) => write!(f, "Lock held: {}", key),
            Error::BackendUnavailable(msg) => write!(f, "Backend unavailable: {}", msg),
            Error::WrongType(msg) => write!(f, "Wrong type: {}", msg),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::RepositoryError(msg) => write!(f, "Repository error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendUnavailable(e.to_string())
        } else {
            Error::EncodingError(e.to_string())
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::EncodingError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendUnavailable(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.to_string().contains("WRONGTYPE") {
            Error::WrongType(e.to_string())
        } else {
            Error::BackendUnavailable(format!("Redis error: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NotFound.to_string(), "Key not found");
        assert_eq!(
            Error::LockHeld("lock:ride:9".to_string()).to_string(),
            "Lock held: lock:ride:9"
        );
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "test error".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_fall_back_classification() {
        assert!(Error::NotFound.should_fall_back());
        assert!(Error::BackendUnavailable("down".into()).should_fall_back());
        assert!(Error::Timeout("slow".into()).should_fall_back());
        assert!(!Error::LockHeld("k".into()).should_fall_back());
        assert!(!Error::EncodingError("bad".into()).should_fall_back());
    }

    #[test]
    fn test_encoding_classification() {
        assert!(Error::EncodingError("x".into()).is_encoding());
        assert!(Error::VersionMismatch {
            expected: 1,
            found: 2
        }
        .is_encoding());
        assert!(!Error::NotFound.is_encoding());
    }

    #[test]
    fn test_json_error_is_encoding() {
        let err = serde_json::from_str::<u32>("not a number").unwrap_err();
        assert!(Error::from(err).is_encoding());
    }
}
