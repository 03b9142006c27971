//! # ride-cache
//!
//! The shared coordination layer of a ride-hailing backend: a keyed cache with
//! TTL semantics, atomic counters and fixed-window rate limiting, advisory
//! distributed locks, a geospatial index for driver matching, and in-process
//! publish/subscribe fan-out.
//!
//! ## Features
//!
//! - **Backend Agnostic:** every component talks to a [`CacheBackend`]; an
//!   in-memory backend ships by default and Redis sits behind the `redis` feature
//! - **Volatile by design:** the cache is best-effort, callers fall back to the
//!   durable store on a miss (see [`Error::should_fall_back`])
//! - **Bounded:** every round-trip honours the configured operation deadline
//! - **Namespaced:** all keys are prefixed with the configured namespace
//!
//! ## Quick Start
//!
//! ```
//! use ride_cache::{CacheService, backend::InMemoryBackend};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> ride_cache::Result<()> {
//! let cache = CacheService::new(InMemoryBackend::new());
//!
//! // Rate limiting is an ordinary value, never an error
//! let verdict = cache.check_rate_limit("login:10.0.0.7", 5, Duration::from_secs(60)).await?;
//! assert!(verdict.allowed);
//!
//! // Mutual exclusion around dispatch
//! let handle = cache.lock("ride:r-1", Duration::from_secs(10)).await?;
//! cache.unlock(&handle).await?;
//!
//! // Entity helpers with fixed key conventions and TTLs
//! cache.entities().cache_user("u-1", &"Ada").await;
//! let name: String = cache.entities().get_cached_user("u-1").await?;
//! assert_eq!(name, "Ada");
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod counter;
pub mod entity;
pub mod error;
pub mod facade;
pub mod geo;
pub mod key;
pub mod lock;
pub mod observability;
pub mod pubsub;
pub mod rate_limit;
pub mod repository;
pub mod serialization;
pub mod service;
pub mod store;
pub mod strategy;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use config::CacheConfig;
pub use counter::AtomicCounter;
pub use entity::{CacheEntity, DriverLocation};
pub use error::{Error, Result};
pub use facade::{EntityCache, EntityKind};
pub use geo::{DistanceUnit, GeoMatch, GeoPoint, GeospatialIndex};
pub use lock::{DistributedLock, LockHandle};
pub use pubsub::{Message, PubSub, Subscription};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use repository::DataRepository;
pub use service::CacheService;
pub use store::KeyValueStore;
pub use strategy::CacheStrategy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
