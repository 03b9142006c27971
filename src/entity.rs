//! Core entity trait and the entity types the cache layer owns.

use crate::error::{Error, Result};
use crate::geo::Coordinate;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::hash::Hash;
use std::time::{SystemTime, UNIX_EPOCH};

/// Trait for entities cached under `{prefix}:{id}`.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use ride_cache::CacheEntity;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// pub struct Ride {
///     pub id: String,
///     pub status: String,
/// }
///
/// impl CacheEntity for Ride {
///     type Key = String;
///
///     fn cache_key(&self) -> Self::Key {
///         self.id.clone()
///     }
///
///     fn cache_prefix() -> &'static str {
///         "ride"
///     }
/// }
/// ```
pub trait CacheEntity: Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone {
    /// Type of the entity's key/ID (typically String or UUID)
    type Key: Display + Clone + Send + Sync + Eq + Hash + 'static;

    /// Return the entity's unique cache key.
    fn cache_key(&self) -> Self::Key;

    /// Entity class, e.g. "ride". Also selects the TTL class in the facade.
    fn cache_prefix() -> &'static str;

    /// Encode with the versioned envelope. See [`crate::serialization`].
    fn serialize_for_cache(&self) -> Result<Vec<u8>> {
        crate::serialization::serialize_for_cache(self)
    }

    /// Decode and validate the envelope.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCacheEntry`: Bad magic
    /// - `Error::VersionMismatch`: Schema version changed
    /// - `Error::EncodingError`: Corrupted payload
    fn deserialize_from_cache(bytes: &[u8]) -> Result<Self> {
        crate::serialization::deserialize_from_cache(bytes)
    }

    /// Optional: Validate entity after deserialization.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Last reported position of a driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverLocation {
    pub driver_id: String,
    pub longitude: f64,
    pub latitude: f64,
    /// Degrees clockwise from north.
    pub heading: Option<f64>,
    pub speed_kmh: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

impl DriverLocation {
    /// Position reported now.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for an out-of-range coordinate.
    pub fn new(driver_id: impl Into<String>, longitude: f64, latitude: f64) -> Result<Self> {
        Coordinate::new(longitude, latitude)?;
        Ok(DriverLocation {
            driver_id: driver_id.into(),
            longitude,
            latitude,
            heading: None,
            speed_kmh: None,
            updated_at: now_millis(),
        })
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_speed(mut self, speed_kmh: f64) -> Self {
        self.speed_kmh = Some(speed_kmh);
        self
    }

    /// # Errors
    /// Returns `Error::ValidationError` for an out-of-range coordinate.
    pub fn coordinate(&self) -> Result<Coordinate> {
        Coordinate::new(self.longitude, self.latitude)
    }
}

impl CacheEntity for DriverLocation {
    type Key = String;

    fn cache_key(&self) -> Self::Key {
        self.driver_id.clone()
    }

    fn cache_prefix() -> &'static str {
        "driver_location"
    }

    fn validate(&self) -> Result<()> {
        if self.driver_id.is_empty() {
            return Err(Error::ValidationError("driver_id is empty".to_string()));
        }
        self.coordinate().map(|_| ())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
