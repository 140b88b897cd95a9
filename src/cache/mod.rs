//! Typed Build-Once Object Cache
//!
//! Caches expensive-to-build values keyed by (type, key parts), builds each
//! value at most once even under concurrent demand, and optionally mirrors
//! values to a temporary or persistent directory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            ObjectCache                                   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  KeyLockManager        │ EntryStore              │ StatsCollector        │
//! │  ┌──────────────────┐  │ ┌────────────────────┐  │ ┌──────────────────┐  │
//! │  │ per-key slots    │  │ │ TypeId -> bucket   │  │ │ per-type counters│  │
//! │  │ owner + condvar  │  │ │ (16-way sharded)   │  │ │ one lock         │  │
//! │  └──────────────────┘  │ └────────────────────┘  │ └──────────────────┘  │
//! │           │            │           │             │                       │
//! │           └────────────┴───────────┴─────────────┘                       │
//! │                              │                                           │
//! │         Blob files (temp / persist)   ◀──   MemoryMonitor thread         │
//! │         JSON envelope + LZ4 framing         (pressure-driven sweeps)     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Tiers
//!
//! - `MemoryOnly`: resident only; lost when evicted
//! - `MemoryAndTempDir`: resident, mirrored to this instance's temp dir
//! - `MemoryAndPersist`: resident, mirrored to the persistent dir
//! - `PersistOnly`: never resident; read from the persistent dir on demand
//!
//! # Guarantees
//!
//! - A factory runs at most once per (type, key) while its entry exists
//! - A context re-requesting a key it is building fails fast
//! - Waits for another context's build can be bounded by a timeout

mod entry;
mod key;
mod lock;
mod manager;
mod monitor;
mod params;
mod shard;
mod stats;
mod store;
mod tier;
pub mod compression;
pub mod persist;

pub use compression::CompressionAlgorithm;
pub use entry::{CacheEntry, EntryInfo, EntryMetadata};
pub use key::{CacheKey, TypeInfo};
pub use lock::{ActiveKey, ContextId, KeyLockGuard, KeyLockManager, LockCounters};
pub use manager::{CacheItem, CacheItemFactory, IntoCacheKey, ObjectCache};
pub use monitor::{
    parse_meminfo, AvailableMemoryState, MemoryMonitor, MemorySample, MemorySampler,
    MemoryStatus, PressureHandler, SystemMemorySampler,
};
pub use params::CacheParams;
pub use shard::{Shard, ShardedMap};
pub use stats::{AccessKind, CacheStat, StatSnapshot, StatsCollector};
pub use tier::{StorageRoot, Tier};

/// Payloads below this size are written uncompressed
pub const MIN_COMPRESS_SIZE: usize = 512;

/// Longest file stem before falling back to a hashed name
pub const MAX_FILE_STEM_LEN: usize = 160;

/// Longest type directory name before falling back to a hashed name
pub const MAX_TYPE_DIR_LEN: usize = 100;

// =============================================================================
// Tests
// =============================================================================
