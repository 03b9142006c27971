//! Read-through strategies for [`EntityCache::fetch`](crate::facade::EntityCache::fetch).
//!
//! | Strategy | Cache Hit | Cache Miss | Use Case |
//! |----------|-----------|-----------|----------|
//! | **Fresh** | Return | Return None | Hot path that must not touch the database |
//! | **Refresh** | Return | Load + repopulate | Default |
//! | **Invalidate** | Delete, load | Load + repopulate | Right after a mutation |
//! | **Bypass** | Ignore | Load + repopulate | Reads that must see the database |
//!
//! ```
//! use ride_cache::strategy::CacheStrategy;
//!
//! assert_eq!(CacheStrategy::default(), CacheStrategy::Refresh);
//! assert!(CacheStrategy::Bypass.loads_from_repository());
//! ```

use std::fmt;

/// Strategy enum controlling read-through behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Cache only. A miss returns `None` without touching the repository.
    Fresh,

    /// Cache first, repository on miss, then repopulate.
    #[default]
    Refresh,

    /// Delete the cached entry, then load and repopulate.
    Invalidate,

    /// Skip the cache read, load and repopulate for others.
    Bypass,
}

impl CacheStrategy {
    /// `true` if a cache hit is returned without loading.
    pub fn reads_cache(self) -> bool {
        matches!(self, CacheStrategy::Fresh | CacheStrategy::Refresh)
    }

    /// `true` if the repository may be consulted.
    pub fn loads_from_repository(self) -> bool {
        !matches!(self, CacheStrategy::Fresh)
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStrategy::Fresh => write!(f, "Fresh"),
            CacheStrategy::Refresh => write!(f, "Refresh"),
            CacheStrategy::Invalidate => write!(f, "Invalidate"),
            CacheStrategy::Bypass => write!(f, "Bypass"),
        }
    }
}
