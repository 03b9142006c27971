//! Serialization boundary between typed values and cache bytes.
//!
//! Three encodings cross this boundary:
//!
//! - **Cached values** are Postcard payloads wrapped in a versioned envelope:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (varint) │POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "RIDE"              u32                postcard::to_allocvec(T)
//! ```
//!
//! - **Counters** are ASCII decimal integers, the representation Redis uses
//!   for `INCRBY`, so both backends agree on the stored bytes.
//!
//! - **Pub/sub payloads** are JSON, because subscribers are real-time
//!   consumers (websocket fan-out) rather than Rust code.
//!
//! ```rust
//! use ride_cache::serialization::{serialize_for_cache, deserialize_from_cache};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Ride {
//!     id: u64,
//!     status: String,
//! }
//!
//! # fn main() -> ride_cache::Result<()> {
//! let ride = Ride { id: 1, status: "requested".to_string() };
//! let bytes = serialize_for_cache(&ride)?;
//! let decoded: Ride = deserialize_from_cache(&bytes)?;
//! assert_eq!(ride, decoded);
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Magic header identifying entries written by this crate.
pub const CACHE_MAGIC: [u8; 4] = *b"RIDE";

/// Current schema version.
///
/// Bump when a cached type changes shape (fields added, removed, reordered or
/// retyped). Entries written under another version decode as
/// `Error::VersionMismatch` and are treated as misses.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope for cache entries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheEnvelope<T> {
    /// Magic header: must be b"RIDE"
    pub magic: [u8; 4],
    /// Schema version: must match CURRENT_SCHEMA_VERSION
    pub version: u32,
    /// The actual cached data
    pub payload: T,
}

impl<T> CacheEnvelope<T> {
    /// Create a new envelope with current magic and version.
    pub fn new(payload: T) -> Self {
        Self {
            magic: CACHE_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// Serialize a value with envelope for cache storage.
///
/// # Errors
///
/// Returns `Error::EncodingError` if the value cannot be represented in Postcard
/// (for example a map with non-string keys inside an untagged enum).
pub fn serialize_for_cache<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let envelope = CacheEnvelope::new(value);
    postcard::to_allocvec(&envelope).map_err(|e| {
        error!("Cache serialization failed: {}", e);
        Error::EncodingError(e.to_string())
    })
}

/// Deserialize a value from cache storage with validation.
///
/// # Errors
///
/// - `Error::EncodingError`: truncated or corrupted payload
/// - `Error::InvalidCacheEntry`: magic header mismatch
/// - `Error::VersionMismatch`: entry written under another schema version
pub fn deserialize_from_cache<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: CacheEnvelope<T> = postcard::from_bytes(bytes).map_err(|e| {
        error!("Cache deserialization failed: {}", e);
        Error::EncodingError(e.to_string())
    })?;

    if envelope.magic != CACHE_MAGIC {
        warn!(
            "Invalid cache entry: expected magic {:?}, got {:?}",
            CACHE_MAGIC, envelope.magic
        );
        return Err(Error::InvalidCacheEntry(format!(
            "Invalid magic: expected {:?}, got {:?}",
            CACHE_MAGIC, envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        warn!(
            "Cache version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION, envelope.version
        );
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}

/// Encode a counter value as ASCII decimal.
pub fn encode_counter(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Decode an ASCII decimal counter.
///
/// # Errors
///
/// Returns `Error::EncodingError` if the bytes are not a decimal `i64`.
pub fn decode_counter(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            Error::EncodingError(format!(
                "value is not an integer counter ({} bytes)",
                bytes.len()
            ))
        })
}

/// Encode a pub/sub payload as JSON.
///
/// # Errors
///
/// Returns `Error::EncodingError` if `serde_json` rejects the value.
pub fn encode_message<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        error!("Message serialization failed: {}", e);
        Error::EncodingError(e.to_string())
    })
}

/// Decode a JSON pub/sub payload.
///
/// # Errors
///
/// Returns `Error::EncodingError` if the payload is not valid JSON for `T`.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::EncodingError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
    struct RideSummary {
        id: u64,
        rider_id: String,
        fare_cents: i64,
        completed: bool,
    }

    fn sample() -> RideSummary {
        RideSummary {
            id: 77,
            rider_id: "u-9".to_string(),
            fare_cents: 1450,
            completed: false,
        }
    }

    #[test]
    fn test_envelope_structure() {
        let bytes = serialize_for_cache(&sample()).unwrap();

        // postcard is varint-encoded, so inspect through the envelope type
        let envelope: CacheEnvelope<RideSummary> = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(envelope.magic, CACHE_MAGIC);
        assert_eq!(envelope.version, CURRENT_SCHEMA_VERSION);
        assert_eq!(envelope.payload, sample());
        assert_eq!(&bytes[0..4], b"RIDE");
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let mut bytes = vec![0u8; 32];
        bytes[0..4].copy_from_slice(b"XXXX");
        bytes[4] = 1; // varint version 1

        let result: Result<RideSummary> = deserialize_from_cache(&bytes);
        match result {
            Err(Error::InvalidCacheEntry(_)) => {}
            other => panic!("Expected InvalidCacheEntry, got {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut envelope = CacheEnvelope::new(sample());
        envelope.version = 999;

        let bytes = postcard::to_allocvec(&envelope).unwrap();
        match deserialize_from_cache::<RideSummary>(&bytes) {
            Err(Error::VersionMismatch { expected, found }) => {
                assert_eq!(expected, CURRENT_SCHEMA_VERSION);
                assert_eq!(found, 999);
            }
            other => panic!("Expected VersionMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload_is_encoding_error() {
        let mut bytes = serialize_for_cache(&sample()).unwrap();
        bytes.truncate(6);

        let err = deserialize_from_cache::<RideSummary>(&bytes).unwrap_err();
        assert!(err.is_encoding());
    }

    #[test]
    fn test_wrong_destination_type_is_encoding_error() {
        let bytes = serialize_for_cache(&"just a string").unwrap();
        let err = deserialize_from_cache::<HashMap<String, u64>>(&bytes).unwrap_err();
        assert!(err.is_encoding());
    }

    #[test]
    fn test_counter_encoding_is_decimal() {
        assert_eq!(encode_counter(-42), b"-42".to_vec());
        assert_eq!(decode_counter(b"17").unwrap(), 17);
        assert!(decode_counter(b"seventeen").is_err());
        assert!(decode_counter(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_message_encoding_is_json() {
        let bytes = encode_message(&sample()).unwrap();
        assert_eq!(bytes[0], b'{');
        let decoded: RideSummary = decode_message(&bytes).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_non_string_map_keys_fail_json_encoding() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");
        assert!(matches!(encode_message(&map), Err(Error::EncodingError(_))));
    }
}
