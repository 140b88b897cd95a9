//! Cache Entry Types
//!
//! A cache entry owns one value for one key: the resident copy (if any), the
//! tier it was created with, the mirror file location and access bookkeeping.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::key::CacheKey;
use super::tier::Tier;

/// Type-erased resident value
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Process-wide logical clock ordering accesses for LRU decisions
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_tick() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// Access bookkeeping for cache entries
#[derive(Debug)]
pub struct EntryMetadata {
    /// Size estimate in bytes
    size: AtomicU64,
    /// Creation timestamp
    created_at: DateTime<Utc>,
    /// Last access (logical clock tick, for LRU ordering)
    last_access_tick: AtomicU64,
    /// Last access (epoch milliseconds, for reporting)
    last_access_ms: AtomicI64,
    /// Access count
    access_count: AtomicU32,
}

impl EntryMetadata {
    /// Create metadata for a freshly built or loaded value
    pub fn new(size: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            size: AtomicU64::new(size),
            created_at,
            last_access_tick: AtomicU64::new(next_tick()),
            last_access_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            access_count: AtomicU32::new(0),
        }
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&self) -> u32 {
        self.last_access_tick.store(next_tick(), Ordering::Relaxed);
        self.last_access_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Logical time of the last access; smaller is older
    #[inline]
    pub fn last_access_tick(&self) -> u64 {
        self.last_access_tick.load(Ordering::Relaxed)
    }

    /// Wall-clock time of the last access
    pub fn last_access(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_access_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }
}

/// One cached value
pub struct CacheEntry {
    /// Tier requested at creation (fixed)
    tier: Tier,
    /// Bookkeeping
    pub metadata: EntryMetadata,
    /// Resident value; None for PersistOnly or after eviction
    resident: RwLock<Option<ErasedValue>>,
    /// Mirror file; None for MemoryOnly or after a failed write
    mirror: RwLock<Option<PathBuf>>,
    /// Cleared once the entry leaves the store
    valid: AtomicBool,
}

impl CacheEntry {
    /// Create a new entry
    pub(crate) fn new(
        tier: Tier,
        resident: Option<ErasedValue>,
        mirror: Option<PathBuf>,
        size: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tier,
            metadata: EntryMetadata::new(size, created_at),
            resident: RwLock::new(resident),
            mirror: RwLock::new(mirror),
            valid: AtomicBool::new(true),
        }
    }

    /// Tier requested at creation
    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Tier actually in effect; a failed mirror write leaves MemoryOnly
    pub fn effective_tier(&self) -> Tier {
        if self.tier.storage_root().is_some() && self.mirror.read().is_none() {
            Tier::MemoryOnly
        } else {
            self.tier
        }
    }

    /// Resident value downcast to `T`
    pub(crate) fn resident<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let guard = self.resident.read();
        guard.as_ref().and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    #[inline]
    pub fn is_resident(&self) -> bool {
        self.resident.read().is_some()
    }

    pub(crate) fn set_resident(&self, value: ErasedValue) {
        *self.resident.write() = Some(value);
    }

    /// Drop the resident copy if the value survives on disk.
    ///
    /// Returns true if a resident copy was released.
    pub(crate) fn drop_resident(&self) -> bool {
        if !self.effective_tier().is_droppable() {
            return false;
        }
        self.resident.write().take().is_some()
    }

    /// Mirror file path, if the entry is mirrored
    pub fn mirror_path(&self) -> Option<PathBuf> {
        self.mirror.read().clone()
    }

    /// Forget the mirror file; the entry behaves as MemoryOnly from now on
    pub(crate) fn degrade(&self) -> Option<PathBuf> {
        self.mirror.write().take()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    #[inline]
    pub fn record_access(&self) -> u32 {
        self.metadata.record_access()
    }

    /// Point-in-time description of this entry
    pub fn info(&self, key: &CacheKey) -> EntryInfo {
        EntryInfo {
            key: key.clone(),
            tier: self.tier,
            effective_tier: self.effective_tier(),
            resident: self.is_resident(),
            size: self.metadata.size(),
            access_count: self.metadata.access_count(),
            created_at: self.metadata.created_at(),
            last_access: self.metadata.last_access(),
            mirror: self.mirror_path(),
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("tier", &self.tier)
            .field("effective_tier", &self.effective_tier())
            .field("resident", &self.is_resident())
            .field("size", &self.metadata.size())
            .field("access_count", &self.metadata.access_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Snapshot of one entry, returned by introspection calls
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub tier: Tier,
    pub effective_tier: Tier,
    pub resident: bool,
    pub size: u64,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub mirror: Option<PathBuf>,
}

impl EntryInfo {
    /// Mirror file path as a borrowed Path
    pub fn mirror_path(&self) -> Option<&Path> {
        self.mirror.as_deref()
    }
}

// =============================================================================
// Tests
// =============================================================================
