//! tiercache - Typed Build-Once Object Cache
//!
//! An in-process cache for values that are expensive to build. Each value is
//! identified by its Rust type plus a list of string key parts, is built at
//! most once even when many threads ask for it at the same time, and can be
//! mirrored to a temporary or persistent directory so it survives memory
//! pressure or a restart.
//!
//! # Example
//!
//! ```no_run
//! use tiercache::{CacheKey, CacheParams, ObjectCache, Tier};
//!
//! # fn main() -> tiercache::Result<()> {
//! let cache = ObjectCache::new(CacheParams::with_root("/var/cache/app"))?;
//! let report = cache.get_item(["report", "2024"], Tier::MemoryAndPersist, |key: &CacheKey| {
//!     anyhow::Ok(format!("built {}", key.joined()))
//! })?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Object cache, key locks, tiers, persistence and memory monitor
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    AvailableMemoryState, CacheItem, CacheItemFactory, CacheKey, CacheParams, CacheStat,
    EntryInfo, LockCounters, MemoryStatus, ObjectCache, StatSnapshot, Tier, TypeInfo,
};
pub use error::{Error, Result};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
