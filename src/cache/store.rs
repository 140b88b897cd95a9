//! Entry Store
//!
//! Per-type partitions of cache entries. Lookups take only a shard read
//! lock and never wait on a build; inserts and removals are made by the
//! holder of the key's build lock.

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;

use super::entry::CacheEntry;
use super::key::{CacheKey, TypeInfo};
use super::shard::ShardedMap;

/// Shards per type bucket
pub const BUCKET_SHARDS: usize = 16;

/// Per-type partition: CacheKey -> CacheEntry
pub struct TypeBucket {
    type_info: TypeInfo,
    entries: ShardedMap<CacheKey, Arc<CacheEntry>, BUCKET_SHARDS>,
}

impl TypeBucket {
    fn new(type_info: TypeInfo) -> Self {
        Self {
            type_info,
            entries: ShardedMap::new(),
        }
    }

    #[inline]
    pub fn type_info(&self) -> TypeInfo {
        self.type_info
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&self, key: CacheKey, entry: Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
        self.entries.insert(key, entry)
    }

    /// Remove the entry for `key`, marking it invalid
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            entry.invalidate();
        }
        removed
    }

    /// Remove the entry only if it is still `expected`
    pub fn remove_exact(&self, key: &CacheKey, expected: &Arc<CacheEntry>) -> bool {
        let removed = self
            .entries
            .remove_if(key, |current| Arc::ptr_eq(current, expected));
        if let Some(entry) = &removed {
            entry.invalidate();
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all (key, entry) pairs
    pub fn entries(&self) -> Vec<(CacheKey, Arc<CacheEntry>)> {
        self.entries.entries()
    }

    /// Entries ordered least-recently-accessed first
    pub fn entries_by_age(&self) -> Vec<(CacheKey, Arc<CacheEntry>)> {
        let mut entries = self.entries();
        entries.sort_by_key(|(_, entry)| entry.metadata.last_access_tick());
        entries
    }
}

impl std::fmt::Debug for TypeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeBucket")
            .field("type", &self.type_info.name())
            .field("len", &self.len())
            .finish()
    }
}

/// All type buckets
#[derive(Debug, Default)]
pub struct EntryStore {
    buckets: DashMap<TypeId, Arc<TypeBucket>>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket for a type, if one was ever created
    pub fn bucket(&self, type_info: TypeInfo) -> Option<Arc<TypeBucket>> {
        self.buckets
            .get(&type_info.id())
            .map(|bucket| Arc::clone(bucket.value()))
    }

    /// Bucket for a type, creating it on first use
    pub fn bucket_or_create(&self, type_info: TypeInfo) -> Arc<TypeBucket> {
        let bucket = self
            .buckets
            .entry(type_info.id())
            .or_insert_with(|| Arc::new(TypeBucket::new(type_info)));
        Arc::clone(bucket.value())
    }

    /// Read-only lookup; never blocks on a build
    pub fn lookup(&self, type_info: TypeInfo, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.bucket(type_info).and_then(|bucket| bucket.get(key))
    }

    /// Snapshot of all buckets
    pub fn buckets(&self) -> Vec<Arc<TypeBucket>> {
        self.buckets
            .iter()
            .map(|bucket| Arc::clone(bucket.value()))
            .collect()
    }

    /// Total entries across all types
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
