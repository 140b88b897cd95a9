//! Object Cache - Typed Build-Once Cache
//!
//! Orchestrates the entry store, key locks, persistence tiers, statistics
//! and the memory monitor behind one typed API.
//!
//! # Lookup flow
//!
//! ```text
//! get_item ─▶ resident hit? ──yes──▶ FromMemory
//!                 │ no
//!                 ▼
//!          acquire key lock (reentrance / timeout)
//!                 │
//!                 ▼
//!          resident now? ──yes──▶ FromMemory
//!          mirrored entry? ─yes─▶ reload blob ─▶ LoadFile
//!          prior-process blob? ─▶ adopt blob  ─▶ LoadFile
//!                 │ no
//!                 ▼
//!          factory ─▶ mirror write ─▶ insert ─▶ Created
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::compression::CompressionAlgorithm;
use super::entry::{CacheEntry, EntryInfo, ErasedValue};
use super::key::{CacheKey, TypeInfo};
use super::lock::{ContextId, KeyLockManager, LockCounters};
use super::monitor::{
    AvailableMemoryState, MemoryMonitor, MemorySampler, MemoryStatus, PressureHandler,
    SystemMemorySampler,
};
use super::params::CacheParams;
use super::persist;
use super::stats::{AccessKind, CacheStat, StatSnapshot, StatsCollector};
use super::store::{EntryStore, TypeBucket};
use super::tier::{StorageRoot, Tier};
use crate::error::{Error, Result};

/// Values the cache can hold
pub trait CacheItem: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheItem for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Builds a value for a key on a cache miss
pub trait CacheItemFactory<T> {
    fn create_cache_item(&self, key: &CacheKey) -> anyhow::Result<T>;
}

impl<T, F> CacheItemFactory<T> for F
where
    F: Fn(&CacheKey) -> anyhow::Result<T>,
{
    fn create_cache_item(&self, key: &CacheKey) -> anyhow::Result<T> {
        self(key)
    }
}

/// Anything that names a cache key
pub trait IntoCacheKey {
    fn into_cache_key(self) -> Result<CacheKey>;
}

impl IntoCacheKey for CacheKey {
    fn into_cache_key(self) -> Result<CacheKey> {
        Ok(self)
    }
}

impl IntoCacheKey for &CacheKey {
    fn into_cache_key(self) -> Result<CacheKey> {
        Ok(self.clone())
    }
}

impl IntoCacheKey for &str {
    fn into_cache_key(self) -> Result<CacheKey> {
        CacheKey::new([self])
    }
}

impl IntoCacheKey for &[&str] {
    fn into_cache_key(self) -> Result<CacheKey> {
        CacheKey::new(self.iter().copied())
    }
}

impl<const N: usize> IntoCacheKey for [&str; N] {
    fn into_cache_key(self) -> Result<CacheKey> {
        CacheKey::new(self)
    }
}

impl IntoCacheKey for Vec<String> {
    fn into_cache_key(self) -> Result<CacheKey> {
        CacheKey::new(self)
    }
}

impl IntoCacheKey for &[String] {
    fn into_cache_key(self) -> Result<CacheKey> {
        CacheKey::new(self.iter().cloned())
    }
}

/// Shared state; the memory monitor holds it weakly
struct CacheInner {
    /// Instance id, names this instance's temp directory
    id: Uuid,
    params: RwLock<CacheParams>,
    store: EntryStore,
    locks: KeyLockManager,
    stats: StatsCollector,
    sampler: Arc<dyn MemorySampler>,
    memory: Arc<RwLock<MemoryStatus>>,
}

/// Typed object cache
pub struct ObjectCache {
    inner: Arc<CacheInner>,
    monitor: Mutex<Option<MemoryMonitor>>,
    shut_down: AtomicBool,
}

impl ObjectCache {
    /// Create a cache reading the operating system's memory telemetry
    pub fn new(params: CacheParams) -> Result<Self> {
        Self::with_sampler(params, Arc::new(SystemMemorySampler))
    }

    /// Create a cache with a custom memory telemetry source
    pub fn with_sampler(params: CacheParams, sampler: Arc<dyn MemorySampler>) -> Result<Self> {
        params.validate()?;
        let monitor_enabled = params.monitor_enabled;

        let inner = Arc::new(CacheInner {
            id: Uuid::new_v4(),
            params: RwLock::new(params),
            store: EntryStore::new(),
            locks: KeyLockManager::new(),
            stats: StatsCollector::new(),
            sampler,
            memory: Arc::new(RwLock::new(MemoryStatus::default())),
        });

        let monitor = if monitor_enabled {
            let handler: Weak<dyn PressureHandler> =
                Arc::downgrade(&inner) as Weak<dyn PressureHandler>;
            Some(MemoryMonitor::spawn(
                Arc::clone(&inner.sampler),
                handler,
                Arc::clone(&inner.memory),
            )?)
        } else {
            None
        };

        info!(
            instance = %inner.id,
            monitor = monitor_enabled,
            "Object cache started"
        );

        Ok(Self {
            inner,
            monitor: Mutex::new(monitor),
            shut_down: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Primary API
    // =========================================================================

    /// Get the value for `keys`, building it with `factory` on a miss.
    ///
    /// Waits without limit for another context's build of the same key.
    pub fn get_item<T, F>(&self, keys: impl IntoCacheKey, tier: Tier, factory: F) -> Result<Arc<T>>
    where
        T: CacheItem,
        F: CacheItemFactory<T>,
    {
        self.get_item_with_timeout(keys, tier, factory, None)
    }

    /// Get the value for `keys`, waiting at most `timeout` for another
    /// context's build of the same key.
    #[instrument(
        level = "debug",
        skip_all,
        fields(type_name = std::any::type_name::<T>(), %tier)
    )]
    pub fn get_item_with_timeout<T, F>(
        &self,
        keys: impl IntoCacheKey,
        tier: Tier,
        factory: F,
        timeout: Option<Duration>,
    ) -> Result<Arc<T>>
    where
        T: CacheItem,
        F: CacheItemFactory<T>,
    {
        let key = keys.into_cache_key()?;
        let type_info = TypeInfo::of::<T>();
        let inner = &self.inner;

        if let Some(value) = inner.resident_hit::<T>(type_info, &key) {
            return Ok(value);
        }

        let _guard = inner.locks.acquire(type_info, &key, timeout)?;

        if let Some(value) = inner.resident_hit::<T>(type_info, &key) {
            return Ok(value);
        }

        if let Some(entry) = inner.store.lookup(type_info, &key) {
            match inner.reload::<T>(type_info, &key, &entry) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        type_name = type_info.name(),
                        key = %key,
                        error = %e,
                        "Persisted copy unusable, rebuilding"
                    );
                    inner.stats.record_persist_error(type_info);
                    if let Some(bucket) = inner.store.bucket(type_info) {
                        if bucket.remove_exact(&key, &entry) {
                            inner.discard_mirror(&entry, &key);
                        }
                    }
                }
            }
        }

        if tier.survives_restart() {
            if let Some(value) = inner.adopt_persisted::<T>(type_info, &key, tier) {
                return Ok(value);
            }
        }

        inner.build(type_info, key, tier, &factory)
    }

    /// Remove one entry of type `T` and its persisted file.
    ///
    /// Waits for an in-flight build of the key to finish first. Returns
    /// whether a resident or persisted entry existed.
    #[instrument(skip_all, fields(type_name = std::any::type_name::<T>()))]
    pub fn clear_item<T: CacheItem>(&self, keys: impl IntoCacheKey) -> Result<bool> {
        let key = keys.into_cache_key()?;
        let type_info = TypeInfo::of::<T>();
        let inner = &self.inner;

        let _guard = inner.locks.acquire(type_info, &key, None)?;

        let mut existed = false;
        if let Some(entry) = inner.store.bucket(type_info).and_then(|b| b.remove(&key)) {
            existed = true;
            inner.discard_mirror(&entry, &key);
        }

        let persisted = persist::blob_path(&inner.params.read().persist_dir, type_info, &key);
        match persist::remove_blob(&persisted) {
            Ok(removed) => existed |= removed,
            Err(e) => warn!(path = %persisted.display(), error = %e, "Failed to remove persisted file"),
        }

        inner.stats.record_delete(type_info, 1);
        debug!(key = %key, existed, "Cleared cache item");
        Ok(existed)
    }

    /// Remove every entry of every type, with their persisted files.
    ///
    /// Builds in flight when the call starts are waited for and their results
    /// removed too. Afterwards every blob in the persistent directory is
    /// deleted, including blobs of capacity-evicted entries and of earlier
    /// runs, so the next request for any key runs its factory. Blobs of keys
    /// whose build started during the call are kept.
    #[instrument(skip_all)]
    pub fn clear(&self) -> Result<usize> {
        let inner = &self.inner;
        let me = ContextId::current();
        let mut total = 0;

        // A build the caller itself holds cannot be waited for
        for active in inner.locks.active_keys() {
            if active.owner != me {
                drop(inner.locks.acquire(active.type_info, &active.key, None)?);
            }
        }

        for bucket in inner.store.buckets() {
            let type_info = bucket.type_info();
            let mut removed = 0u64;

            for (key, entry) in bucket.entries() {
                let _guard = inner.locks.acquire(type_info, &key, None)?;
                if bucket.remove_exact(&key, &entry) {
                    inner.discard_mirror(&entry, &key);
                    removed += 1;
                }
            }

            if removed > 0 {
                inner.stats.record_delete(type_info, removed);
            }
            total += removed as usize;
        }

        let swept = inner.sweep_persist_dir();
        info!(removed = total, swept, "Cleared object cache");
        Ok(total)
    }

    /// Read a persisted value without building it.
    ///
    /// Fails with [`Error::PersistedFileMissing`] when no blob exists, so
    /// callers can decide whether to rebuild.
    pub fn load_persisted<T: CacheItem>(&self, keys: impl IntoCacheKey) -> Result<Arc<T>> {
        let key = keys.into_cache_key()?;
        let type_info = TypeInfo::of::<T>();
        let inner = &self.inner;

        let _guard = inner.locks.acquire(type_info, &key, None)?;

        let path = inner
            .store
            .lookup(type_info, &key)
            .and_then(|entry| entry.mirror_path())
            .unwrap_or_else(|| {
                persist::blob_path(&inner.params.read().persist_dir, type_info, &key)
            });

        let blob = persist::read_blob::<T>(&path, type_info, &key)?;
        Ok(Arc::new(blob.value))
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Aggregate counters across all types
    pub fn stat(&self) -> CacheStat {
        self.inner.stats.snapshot().total
    }

    /// Counters for one type
    pub fn stat_of<T: 'static>(&self) -> CacheStat {
        self.inner.stats.stat_of(TypeInfo::of::<T>())
    }

    /// Per-type counters
    pub fn stats_by_type(&self) -> Vec<(TypeInfo, CacheStat)> {
        self.inner.stats.snapshot().by_type
    }

    /// Aggregate and per-type counters from one consistent copy
    pub fn stat_snapshot(&self) -> StatSnapshot {
        self.inner.stats.snapshot()
    }

    /// Reset all counters
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Whether an entry for `keys` exists (resident or not)
    pub fn contains<T: 'static>(&self, keys: impl IntoCacheKey) -> Result<bool> {
        let key = keys.into_cache_key()?;
        Ok(self.inner.store.lookup(TypeInfo::of::<T>(), &key).is_some())
    }

    /// Whether a build (or reload) of `keys` is in flight
    pub fn is_building<T: 'static>(&self, keys: impl IntoCacheKey) -> Result<bool> {
        let key = keys.into_cache_key()?;
        Ok(self.inner.locks.is_locked(TypeInfo::of::<T>(), &key))
    }

    /// Number of keys with a build in flight
    pub fn building_count(&self) -> usize {
        self.inner.locks.active_count()
    }

    /// Contexts blocked on the in-flight build of `keys`
    pub fn waiting_on<T: 'static>(&self, keys: impl IntoCacheKey) -> Result<usize> {
        let key = keys.into_cache_key()?;
        Ok(self.inner.locks.waiters(TypeInfo::of::<T>(), &key))
    }

    /// Key lock acquisitions, timeouts, reentrances and broken cycles
    pub fn lock_counters(&self) -> LockCounters {
        self.inner.locks.counters()
    }

    /// Total entries across all types
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Entries of type `T`
    pub fn len_of<T: 'static>(&self) -> usize {
        self.inner
            .store
            .bucket(TypeInfo::of::<T>())
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    /// Descriptions of all entries of type `T`, least recently used first
    pub fn entries<T: 'static>(&self) -> Vec<EntryInfo> {
        self.inner
            .store
            .bucket(TypeInfo::of::<T>())
            .map(|bucket| {
                bucket
                    .entries_by_age()
                    .iter()
                    .map(|(key, entry)| entry.info(key))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Description of one entry
    pub fn entry_info<T: 'static>(&self, keys: impl IntoCacheKey) -> Result<Option<EntryInfo>> {
        let key = keys.into_cache_key()?;
        Ok(self
            .inner
            .store
            .lookup(TypeInfo::of::<T>(), &key)
            .map(|entry| entry.info(&key)))
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Current parameters
    pub fn params(&self) -> CacheParams {
        self.inner.params.read().clone()
    }

    /// Change parameters; applies to operations that start afterwards
    pub fn update_params(&self, f: impl FnOnce(&mut CacheParams)) -> Result<()> {
        let mut params = self.inner.params.write();
        let mut updated = params.clone();
        f(&mut updated);
        updated.validate()?;
        *params = updated;
        Ok(())
    }

    // =========================================================================
    // Memory & Eviction
    // =========================================================================

    /// Last memory status recorded by the monitor
    pub fn memory_status(&self) -> MemoryStatus {
        *self.inner.memory.read()
    }

    /// Sample memory now and sweep if under pressure
    pub fn check_memory(&self) -> MemoryStatus {
        let params = self.params();
        let status = MemoryStatus::classify(self.inner.sampler.sample(), &params);
        *self.inner.memory.write() = status;
        if status.under_pressure() {
            self.inner.on_pressure(&status);
        }
        status
    }

    /// Drop up to `max` resident copies of values that survive on disk,
    /// least recently used first. Returns how many were dropped.
    pub fn evict_resident(&self, max: usize) -> usize {
        self.inner.evict_resident(max)
    }

    /// Evict least recently used entries of every type down to `capacity`
    pub fn trim_to_capacity(&self) -> usize {
        self.inner
            .store
            .buckets()
            .iter()
            .map(|bucket| self.inner.enforce_capacity(bucket, None))
            .sum()
    }

    /// Whether the memory monitor thread is running
    pub fn monitor_running(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .is_some_and(|monitor| monitor.is_running())
    }

    /// Stop the memory monitor and delete this instance's temp files.
    ///
    /// Persistent files are kept. Called automatically on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.stop();
        }

        let inner = &self.inner;
        let mut removed = 0usize;
        for bucket in inner.store.buckets() {
            for (key, entry) in bucket.entries() {
                if entry.tier() == Tier::MemoryAndTempDir {
                    if let Some(path) = entry.degrade() {
                        removed += usize::from(inner.remove_file(&path, &key));
                    }
                }
            }
        }

        let temp_root = inner.temp_root(&inner.params.read());
        match std::fs::remove_dir_all(&temp_root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %temp_root.display(), error = %e, "Failed to remove temp directory"),
        }

        info!(instance = %inner.id, temp_files_removed = removed, "Object cache shut down");
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("instance", &self.inner.id)
            .field("entries", &self.len())
            .field("building", &self.building_count())
            .finish()
    }
}

impl Drop for ObjectCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CacheInner {
    /// Temp directory of this instance
    fn temp_root(&self, params: &CacheParams) -> PathBuf {
        params.temp_dir.join(self.id.to_string())
    }

    fn compression(params: &CacheParams) -> CompressionAlgorithm {
        if params.compress_files {
            CompressionAlgorithm::Lz4
        } else {
            CompressionAlgorithm::None
        }
    }

    /// Serve a resident copy without locking
    fn resident_hit<T: CacheItem>(&self, type_info: TypeInfo, key: &CacheKey) -> Option<Arc<T>> {
        let entry = self.store.lookup(type_info, key)?;
        let value = entry.resident::<T>()?;
        entry.record_access();
        self.stats.record_access(type_info, AccessKind::FromMemory);
        Some(value)
    }

    /// Read a non-resident entry back from its mirror file
    fn reload<T: CacheItem>(
        &self,
        type_info: TypeInfo,
        key: &CacheKey,
        entry: &Arc<CacheEntry>,
    ) -> Result<Arc<T>> {
        let path = entry
            .mirror_path()
            .ok_or_else(|| Error::PersistedFileMissing {
                path: PathBuf::new(),
            })?;

        let blob = persist::read_blob::<T>(&path, type_info, key)?;
        let value = Arc::new(blob.value);
        if entry.tier().keeps_resident() {
            entry.set_resident(Arc::clone(&value) as ErasedValue);
        }

        entry.record_access();
        self.stats.record_access(type_info, AccessKind::LoadFile);
        debug!(type_name = type_info.name(), key = %key, "Reloaded from file");
        Ok(value)
    }

    /// Reuse a blob left in the persistent directory, e.g. by an earlier run
    fn adopt_persisted<T: CacheItem>(
        &self,
        type_info: TypeInfo,
        key: &CacheKey,
        tier: Tier,
    ) -> Option<Arc<T>> {
        let path = persist::blob_path(&self.params.read().persist_dir, type_info, key);
        if !persist::blob_exists(&path) {
            return None;
        }

        let blob = match persist::read_blob::<T>(&path, type_info, key) {
            Ok(blob) => blob,
            Err(Error::PersistedFileMissing { .. }) => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable persisted file");
                self.stats.record_persist_error(type_info);
                let _ = persist::remove_blob(&path);
                return None;
            }
        };

        let value = Arc::new(blob.value);
        let resident = tier
            .keeps_resident()
            .then(|| Arc::clone(&value) as ErasedValue);
        let entry = Arc::new(CacheEntry::new(
            tier,
            resident,
            Some(path),
            blob.size,
            blob.created_at,
        ));
        entry.record_access();

        self.insert(type_info, key.clone(), entry);
        self.stats.record_access(type_info, AccessKind::LoadFile);
        debug!(type_name = type_info.name(), key = %key, "Adopted persisted file");
        Some(value)
    }

    /// Run the factory and store the result per `tier`
    fn build<T, F>(&self, type_info: TypeInfo, key: CacheKey, tier: Tier, factory: &F) -> Result<Arc<T>>
    where
        T: CacheItem,
        F: CacheItemFactory<T>,
    {
        debug!(type_name = type_info.name(), key = %key, %tier, "Building cache item");

        let value = Arc::new(
            factory
                .create_cache_item(&key)
                .map_err(Error::from_factory)?,
        );
        let created_at = Utc::now();
        let mut size = std::mem::size_of::<T>() as u64;

        let mirror = tier.storage_root().and_then(|root| {
            let params = self.params.read().clone();
            let dir = match root {
                StorageRoot::Temp => self.temp_root(&params),
                StorageRoot::Persist => params.persist_dir.clone(),
            };
            let path = persist::blob_path(&dir, type_info, &key);

            match persist::write_blob(
                &path,
                type_info,
                &key,
                created_at,
                &*value,
                Self::compression(&params),
            ) {
                Ok(bytes) => {
                    size = bytes;
                    Some(path)
                }
                Err(e) => {
                    warn!(
                        type_name = type_info.name(),
                        key = %key,
                        %tier,
                        error = %e,
                        "Mirror write failed, keeping value in memory only"
                    );
                    self.stats.record_persist_error(type_info);
                    None
                }
            }
        });

        let resident = (tier.keeps_resident() || mirror.is_none())
            .then(|| Arc::clone(&value) as ErasedValue);
        let entry = Arc::new(CacheEntry::new(tier, resident, mirror, size, created_at));
        entry.record_access();

        self.insert(type_info, key, entry);
        self.stats.record_access(type_info, AccessKind::Created);
        Ok(value)
    }

    /// Insert under the key's build lock, then enforce capacity
    fn insert(&self, type_info: TypeInfo, key: CacheKey, entry: Arc<CacheEntry>) {
        let bucket = self.store.bucket_or_create(type_info);
        if let Some(old) = bucket.insert(key.clone(), entry) {
            old.invalidate();
        }
        self.enforce_capacity(&bucket, Some(&key));
    }

    /// Evict least recently used entries until the bucket fits `capacity`.
    ///
    /// Entries whose key is locked by a build are skipped.
    fn enforce_capacity(&self, bucket: &Arc<TypeBucket>, protect: Option<&CacheKey>) -> usize {
        let Some(capacity) = self.params.read().capacity_limit() else {
            return 0;
        };
        if bucket.len() <= capacity {
            return 0;
        }

        let type_info = bucket.type_info();
        let mut evicted = 0;
        for (key, entry) in bucket.entries_by_age() {
            if bucket.len() <= capacity {
                break;
            }
            if protect == Some(&key) {
                continue;
            }
            let Some(_guard) = self.locks.try_acquire(type_info, &key) else {
                continue;
            };
            if bucket.remove_exact(&key, &entry) {
                // Persist-tier files stay on disk and are adopted on the next request
                if entry.tier() == Tier::MemoryAndTempDir {
                    self.discard_mirror(&entry, &key);
                }
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.stats.record_eviction(type_info, evicted as u64);
            debug!(type_name = type_info.name(), evicted, capacity, "Capacity eviction");
        }
        evicted
    }

    /// Drop resident copies of droppable entries, oldest first
    fn evict_resident(&self, max: usize) -> usize {
        let mut candidates: Vec<(Arc<TypeBucket>, CacheKey, Arc<CacheEntry>)> = Vec::new();
        for bucket in self.store.buckets() {
            for (key, entry) in bucket.entries() {
                if entry.is_resident() && entry.effective_tier().is_droppable() {
                    candidates.push((Arc::clone(&bucket), key, entry));
                }
            }
        }
        candidates.sort_by_key(|(_, _, entry)| entry.metadata.last_access_tick());

        let mut dropped = 0;
        for (bucket, key, entry) in candidates {
            if dropped >= max {
                break;
            }
            let Some(_guard) = self.locks.try_acquire(bucket.type_info(), &key) else {
                continue;
            };
            if entry.drop_resident() {
                self.stats.record_eviction(bucket.type_info(), 1);
                dropped += 1;
            }
        }
        dropped
    }

    /// Remove whole MemoryOnly entries, oldest first
    fn evict_memory_only(&self, max: usize) -> usize {
        let mut candidates: Vec<(Arc<TypeBucket>, CacheKey, Arc<CacheEntry>)> = Vec::new();
        for bucket in self.store.buckets() {
            for (key, entry) in bucket.entries() {
                if entry.is_resident() && !entry.effective_tier().is_droppable() {
                    candidates.push((Arc::clone(&bucket), key, entry));
                }
            }
        }
        candidates.sort_by_key(|(_, _, entry)| entry.metadata.last_access_tick());

        let mut removed = 0;
        for (bucket, key, entry) in candidates {
            if removed >= max {
                break;
            }
            let Some(_guard) = self.locks.try_acquire(bucket.type_info(), &key) else {
                continue;
            };
            if bucket.remove_exact(&key, &entry) {
                self.discard_mirror(&entry, &key);
                self.stats.record_eviction(bucket.type_info(), 1);
                removed += 1;
            }
        }
        removed
    }

    fn resident_count(&self) -> usize {
        self.store
            .buckets()
            .iter()
            .map(|bucket| {
                bucket
                    .entries()
                    .iter()
                    .filter(|(_, entry)| entry.is_resident())
                    .count()
            })
            .sum()
    }

    /// Delete persisted blobs not owned by a live entry or an in-flight build
    fn sweep_persist_dir(&self) -> usize {
        let persist_dir = self.params.read().persist_dir.clone();

        let mut keep: HashSet<PathBuf> = self
            .store
            .buckets()
            .iter()
            .flat_map(|bucket| bucket.entries())
            .filter_map(|(_, entry)| entry.mirror_path())
            .collect();
        keep.extend(
            self.locks
                .active_keys()
                .into_iter()
                .map(|active| persist::blob_path(&persist_dir, active.type_info, &active.key)),
        );

        match persist::remove_all_blobs(&persist_dir, &keep) {
            Ok(swept) => swept,
            Err(e) => {
                warn!(dir = %persist_dir.display(), error = %e, "Failed to sweep persisted files");
                0
            }
        }
    }

    /// Delete the mirror file of a removed entry
    fn discard_mirror(&self, entry: &CacheEntry, key: &CacheKey) {
        if let Some(path) = entry.degrade() {
            self.remove_file(&path, key);
        }
    }

    fn remove_file(&self, path: &std::path::Path, key: &CacheKey) -> bool {
        match persist::remove_blob(path) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %key, path = %path.display(), error = %e, "Failed to remove mirror file");
                false
            }
        }
    }
}

impl PressureHandler for CacheInner {
    fn params(&self) -> CacheParams {
        self.params.read().clone()
    }

    fn on_pressure(&self, status: &MemoryStatus) {
        let percent = self.params.read().eviction_batch_percent as usize;
        let batch = |count: usize| (count * percent).div_ceil(100).max(1);

        let resident = self.resident_count();
        if resident == 0 {
            return;
        }

        let dropped = self.evict_resident(batch(resident));
        let mut removed = 0;
        if dropped == 0 && status.state == AvailableMemoryState::Low {
            removed = self.evict_memory_only(batch(resident));
        }

        info!(
            state = ?status.state,
            dropped_resident = dropped,
            removed_memory_only = removed,
            "Eviction sweep finished"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::monitor::MemorySample;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn params(root: &std::path::Path) -> CacheParams {
        CacheParams {
            monitor_enabled: false,
            ..CacheParams::with_root(root)
        }
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn(&CacheKey) -> anyhow::Result<String> + '_ {
        move |key| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("value:{}", key.joined()))
        }
    }

    #[test]
    fn test_build_once_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(params(dir.path())).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = cache.get_item(["a", "1"], Tier::MemoryOnly, counting(&calls)).unwrap();
        let b = cache.get_item(["a", "1"], Tier::MemoryOnly, counting(&calls)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.as_str(), "value:a/1");

        let stat = cache.stat_of::<String>();
        assert_eq!(stat.create_count, 1);
        assert_eq!(stat.from_mem_count, 1);
        assert!(stat.is_balanced());
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(params(dir.path())).unwrap();
        let empty: Vec<String> = Vec::new();
        let result = cache.get_item(empty, Tier::MemoryOnly, |_: &CacheKey| anyhow::Ok(1u32));
        assert_matches!(result, Err(Error::InvalidKey(_)));
    }

    #[test]
    fn test_factory_error_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(params(dir.path())).unwrap();

        let result = cache.get_item("k", Tier::MemoryOnly, |_: &CacheKey| -> anyhow::Result<u32> {
            anyhow::bail!("source unavailable")
        });
        assert_matches!(result, Err(Error::Factory(_)));
        assert!(!cache.contains::<u32>("k").unwrap());
        assert!(!cache.is_building::<u32>("k").unwrap());

        let value = cache.get_item("k", Tier::MemoryOnly, |_: &CacheKey| anyhow::Ok(9u32)).unwrap();
        assert_eq!(*value, 9);
        assert_eq!(cache.stat_of::<u32>().access_count, 1);
    }

    #[test]
    fn test_types_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(params(dir.path())).unwrap();

        cache.get_item("same", Tier::MemoryOnly, |_: &CacheKey| anyhow::Ok(1u32)).unwrap();
        let text = cache
            .get_item("same", Tier::MemoryOnly, |_: &CacheKey| anyhow::Ok(String::from("s")))
            .unwrap();
        assert_eq!(text.as_str(), "s");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.len_of::<u32>(), 1);
        assert_eq!(cache.stats_by_type().len(), 2);
    }

    #[test]
    fn test_persist_only_never_resident() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(params(dir.path())).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache.get_item("p", Tier::PersistOnly, counting(&calls)).unwrap();
        let info = cache.entry_info::<String>("p").unwrap().unwrap();
        assert!(!info.resident);
        assert!(info.mirror_path().unwrap().starts_with(dir.path().join("persist")));

        let second = cache.get_item("p", Tier::PersistOnly, counting(&calls)).unwrap();
        assert_eq!(first, second);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stat_of::<String>().load_file_count, 1);
    }

    #[test]
    fn test_mirror_failure_degrades_to_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the persist directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let cache = ObjectCache::new(CacheParams {
            persist_dir: blocker,
            ..params(dir.path())
        })
        .unwrap();

        let value = cache
            .get_item("k", Tier::MemoryAndPersist, |_: &CacheKey| anyhow::Ok(5u64))
            .unwrap();
        assert_eq!(*value, 5);

        let info = cache.entry_info::<u64>("k").unwrap().unwrap();
        assert_eq!(info.tier, Tier::MemoryAndPersist);
        assert_eq!(info.effective_tier, Tier::MemoryOnly);
        assert!(info.resident);
        assert_eq!(cache.evict_resident(10), 0);
        assert_eq!(cache.stat_of::<u64>().persist_error_count, 1);
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(CacheParams {
            capacity: 2,
            ..params(dir.path())
        })
        .unwrap();

        for k in ["a", "b"] {
            cache.get_item(k, Tier::MemoryOnly, |_: &CacheKey| anyhow::Ok(1u8)).unwrap();
        }
        // Touch "a" so "b" is the oldest
        cache.get_item("a", Tier::MemoryOnly, |_: &CacheKey| anyhow::Ok(1u8)).unwrap();
        cache.get_item("c", Tier::MemoryOnly, |_: &CacheKey| anyhow::Ok(1u8)).unwrap();

        assert_eq!(cache.len_of::<u8>(), 2);
        assert!(cache.contains::<u8>("a").unwrap());
        assert!(!cache.contains::<u8>("b").unwrap());
        assert!(cache.contains::<u8>("c").unwrap());
        assert_eq!(cache.stat_of::<u8>().evict_count, 1);
    }

    #[test]
    fn test_update_params_validates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(params(dir.path())).unwrap();

        cache.update_params(|p| p.capacity = 10).unwrap();
        assert_eq!(cache.params().capacity, 10);

        let result = cache.update_params(|p| p.critical_memory_load_percent = 150);
        assert_matches!(result, Err(Error::Config(_)));
        assert_eq!(cache.params().critical_memory_load_percent, 90);
    }

    struct LowMemory;

    impl MemorySampler for LowMemory {
        fn sample(&self) -> Option<MemorySample> {
            Some(MemorySample {
                total_bytes: 1024 * 1024 * 1024,
                available_bytes: 1024,
                swap_total_bytes: 0,
                swap_free_bytes: 0,
            })
        }
    }

    #[test]
    fn test_low_memory_drops_mirrored_before_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::with_sampler(
            CacheParams {
                eviction_batch_percent: 100,
                ..params(dir.path())
            },
            Arc::new(LowMemory),
        )
        .unwrap();

        cache.get_item("m", Tier::MemoryOnly, |_: &CacheKey| anyhow::Ok(1u32)).unwrap();
        cache.get_item("t", Tier::MemoryAndTempDir, |_: &CacheKey| anyhow::Ok(2u32)).unwrap();

        let status = cache.check_memory();
        assert_eq!(status.state, AvailableMemoryState::Low);
        assert!(!cache.entry_info::<u32>("t").unwrap().unwrap().resident);
        assert!(cache.contains::<u32>("m").unwrap());

        // Nothing droppable remains: MemoryOnly goes as a last resort
        cache.check_memory();
        assert!(!cache.contains::<u32>("m").unwrap());
        assert!(cache.contains::<u32>("t").unwrap());

        let t = cache.get_item("t", Tier::MemoryAndTempDir, |_: &CacheKey| anyhow::Ok(0u32)).unwrap();
        assert_eq!(*t, 2);
    }

    #[test]
    fn test_shutdown_removes_temp_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(params(dir.path())).unwrap();

        cache.get_item("t", Tier::MemoryAndTempDir, |_: &CacheKey| anyhow::Ok(1u32)).unwrap();
        cache.get_item("p", Tier::MemoryAndPersist, |_: &CacheKey| anyhow::Ok(2u32)).unwrap();
        let temp = cache.entry_info::<u32>("t").unwrap().unwrap().mirror.unwrap();
        let kept = cache.entry_info::<u32>("p").unwrap().unwrap().mirror.unwrap();
        assert!(temp.exists());

        cache.shutdown();
        assert!(!temp.exists());
        assert!(kept.exists());
        // Idempotent
        cache.shutdown();
    }

    #[test]
    fn test_monitor_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(CacheParams {
            monitor_enabled: true,
            check_memory_interval_ms: 10,
            ..CacheParams::with_root(dir.path())
        })
        .unwrap();
        assert!(cache.monitor_running());
        cache.shutdown();
        assert!(!cache.monitor_running());
    }
}
