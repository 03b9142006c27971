//! Geospatial proximity index.
//!
//! Positions are stored per index (e.g. `"drivers"`) and member, last write
//! wins. Distances are great-circle distances on a spherical earth computed
//! with the haversine formula, using the same earth radius as Redis so the
//! in-memory and Redis backends agree to within geohash precision.
//!
//! The index holds no per-point TTL. A position lingers until it is replaced,
//! removed, or the index is cleared. Freshness of driver positions is carried
//! by the companion `driver_location:{id}` key, which the entity facade writes
//! alongside every index update and cross-checks on every nearby search.

use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::store::Substrate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Earth radius in meters (the value Redis uses for GEO commands).
pub const EARTH_RADIUS_METERS: f64 = 6_372_797.560_856;

/// Largest latitude representable in a geohash-backed index.
pub const MAX_LATITUDE: f64 = 85.051_128_78;

/// Unit for radii and distances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DistanceUnit {
    #[default]
    Meters,
    Kilometers,
    Miles,
    Feet,
}

impl DistanceUnit {
    /// Fixed scale factor to meters.
    pub fn meters_per_unit(self) -> f64 {
        match self {
            DistanceUnit::Meters => 1.0,
            DistanceUnit::Kilometers => 1000.0,
            DistanceUnit::Miles => 1609.34,
            DistanceUnit::Feet => 0.3048,
        }
    }

    pub fn to_meters(self, value: f64) -> f64 {
        value * self.meters_per_unit()
    }

    pub fn from_meters(self, meters: f64) -> f64 {
        meters / self.meters_per_unit()
    }

    /// Redis unit token (`m`, `km`, `mi`, `ft`).
    pub fn as_str(self) -> &'static str {
        match self {
            DistanceUnit::Meters => "m",
            DistanceUnit::Kilometers => "km",
            DistanceUnit::Miles => "mi",
            DistanceUnit::Feet => "ft",
        }
    }
}

impl fmt::Display for DistanceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" => Ok(DistanceUnit::Meters),
            "km" => Ok(DistanceUnit::Kilometers),
            "mi" => Ok(DistanceUnit::Miles),
            "ft" => Ok(DistanceUnit::Feet),
            other => Err(Error::ValidationError(format!(
                "unknown distance unit {:?} (expected m, km, mi or ft)",
                other
            ))),
        }
    }
}

/// A validated longitude/latitude pair, in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinate {
    /// # Errors
    /// Returns `Error::ValidationError` for non-finite values, longitudes
    /// outside [-180, 180] or latitudes outside [-85.05112878, 85.05112878].
    pub fn new(longitude: f64, latitude: f64) -> Result<Self> {
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::ValidationError(format!(
                "invalid longitude {}",
                longitude
            )));
        }
        if !latitude.is_finite() || !(-MAX_LATITUDE..=MAX_LATITUDE).contains(&latitude) {
            return Err(Error::ValidationError(format!(
                "invalid latitude {}",
                latitude
            )));
        }
        Ok(Coordinate {
            longitude,
            latitude,
        })
    }

    /// Great-circle distance in meters.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        haversine_meters(self, other)
    }
}

/// Haversine great-circle distance between two coordinates, in meters.
pub fn haversine_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// A member's position in an index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub member: String,
    pub coordinate: Coordinate,
}

impl GeoPoint {
    /// # Errors
    /// Returns `Error::ValidationError` if the coordinate is out of range.
    pub fn new(member: impl Into<String>, longitude: f64, latitude: f64) -> Result<Self> {
        Ok(GeoPoint {
            member: member.into(),
            coordinate: Coordinate::new(longitude, latitude)?,
        })
    }

    pub fn longitude(&self) -> f64 {
        self.coordinate.longitude
    }

    pub fn latitude(&self) -> f64 {
        self.coordinate.latitude
    }
}

/// A radius search hit.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoMatch {
    pub member: String,
    /// Distance from the search center, in the unit of the query.
    pub distance: f64,
    pub coordinate: Coordinate,
}

/// Filter `points` to those within `radius` of `center`, nearest first.
///
/// Ties are broken by member name so results are deterministic.
pub fn radius_search<I>(points: I, center: &Coordinate, radius: f64, unit: DistanceUnit) -> Vec<GeoMatch>
where
    I: IntoIterator<Item = GeoPoint>,
{
    let limit = unit.to_meters(radius);
    let mut matches: Vec<GeoMatch> = points
        .into_iter()
        .filter_map(|point| {
            let meters = haversine_meters(center, &point.coordinate);
            (meters <= limit).then(|| GeoMatch {
                member: point.member,
                distance: unit.from_meters(meters),
                coordinate: point.coordinate,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.member.cmp(&b.member))
    });
    matches
}

/// Namespaced proximity index over moving entities.
#[derive(Clone)]
pub struct GeospatialIndex<B: CacheBackend> {
    substrate: Substrate<B>,
}

impl<B: CacheBackend> GeospatialIndex<B> {
    pub fn new(backend: B, config: &CacheConfig) -> Self {
        GeospatialIndex {
            substrate: Substrate::new(backend, config),
        }
    }

    pub(crate) fn from_substrate(substrate: Substrate<B>) -> Self {
        GeospatialIndex { substrate }
    }

    /// Upsert positions. Returns how many members were new to the index.
    ///
    /// # Errors
    /// Returns `Error::WrongType` if `index` names a non-geo key, or a backend error.
    pub async fn add(&self, index: &str, points: &[GeoPoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        let key = self.substrate.key(index);
        self.substrate
            .run("GEOADD", self.substrate.backend.geo_add(&key, points))
            .await
    }

    /// Remove a member. Returns `true` if it was present.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn remove(&self, index: &str, member: &str) -> Result<bool> {
        let key = self.substrate.key(index);
        self.substrate
            .run("GEOREM", self.substrate.backend.geo_remove(&key, member))
            .await
    }

    /// Members within `radius` of the center, nearest first, with distances in `unit`.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for an invalid center or negative radius.
    pub async fn radius(
        &self,
        index: &str,
        longitude: f64,
        latitude: f64,
        radius: f64,
        unit: DistanceUnit,
    ) -> Result<Vec<GeoMatch>> {
        let center = Coordinate::new(longitude, latitude)?;
        if !radius.is_finite() || radius < 0.0 {
            return Err(Error::ValidationError(format!("invalid radius {}", radius)));
        }
        let key = self.substrate.key(index);
        self.substrate
            .run(
                "GEORADIUS",
                self.substrate.backend.geo_radius(&key, &center, radius, unit),
            )
            .await
    }

    /// Distance between two stored members. `None` if either is absent.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn dist(
        &self,
        index: &str,
        member_a: &str,
        member_b: &str,
        unit: DistanceUnit,
    ) -> Result<Option<f64>> {
        let key = self.substrate.key(index);
        self.substrate
            .run(
                "GEODIST",
                self.substrate.backend.geo_dist(&key, member_a, member_b, unit),
            )
            .await
    }

    /// Stored positions of `members`, omitting those not in the index.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn pos(&self, index: &str, members: &[&str]) -> Result<Vec<GeoPoint>> {
        let key = self.substrate.key(index);
        self.substrate
            .run("GEOPOS", self.substrate.backend.geo_pos(&key, members))
            .await
    }

    /// Every position in the index.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn members(&self, index: &str) -> Result<Vec<GeoPoint>> {
        let key = self.substrate.key(index);
        self.substrate
            .run("GEOMEMBERS", self.substrate.backend.geo_members(&key))
            .await
    }

    /// Drop the whole index.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn clear(&self, index: &str) -> Result<()> {
        let key = self.substrate.key(index);
        self.substrate
            .run("DEL", self.substrate.backend.delete(&key))
            .await
    }
}
