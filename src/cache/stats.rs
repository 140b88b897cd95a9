//! Cache Statistics
//!
//! Per-type counters. Every update and every snapshot goes through one short
//! critical section, so a snapshot is a consistent point-in-time copy and
//! the aggregate always equals the sum of the per-type values.

use std::any::TypeId;
use std::collections::HashMap;
use std::ops::AddAssign;

use parking_lot::Mutex;
use serde::Serialize;

use super::key::TypeInfo;

/// Snapshot of counters for one type or for all types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStat {
    /// Successful get_item calls
    pub access_count: u64,
    /// Served from the resident copy
    pub from_mem_count: u64,
    /// Served by reading a persisted file
    pub load_file_count: u64,
    /// Served by running the factory
    pub create_count: u64,
    /// Clear calls (and entries removed by a full clear)
    pub del_count: u64,
    /// Resident copies or entries dropped by eviction
    pub evict_count: u64,
    /// Mirror writes or reads that failed
    pub persist_error_count: u64,
}

impl CacheStat {
    /// Share of accesses served without running the factory
    pub fn hit_ratio(&self) -> f64 {
        if self.access_count == 0 {
            0.0
        } else {
            (self.from_mem_count + self.load_file_count) as f64 / self.access_count as f64
        }
    }

    /// access == from_mem + load_file + create
    pub fn is_balanced(&self) -> bool {
        self.access_count == self.from_mem_count + self.load_file_count + self.create_count
    }
}

impl AddAssign for CacheStat {
    fn add_assign(&mut self, other: Self) {
        self.access_count += other.access_count;
        self.from_mem_count += other.from_mem_count;
        self.load_file_count += other.load_file_count;
        self.create_count += other.create_count;
        self.del_count += other.del_count;
        self.evict_count += other.evict_count;
        self.persist_error_count += other.persist_error_count;
    }
}

/// How a successful get_item was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    FromMemory,
    LoadFile,
    Created,
}

/// Per-type statistics with consistent snapshots
#[derive(Debug, Default)]
pub struct StatsCollector {
    by_type: Mutex<HashMap<TypeId, (TypeInfo, CacheStat)>>,
}

/// Aggregate and per-type statistics taken in one critical section
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatSnapshot {
    pub total: CacheStat,
    pub by_type: Vec<(TypeInfo, CacheStat)>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, type_info: TypeInfo, f: impl FnOnce(&mut CacheStat)) {
        let mut by_type = self.by_type.lock();
        let (_, stat) = by_type
            .entry(type_info.id())
            .or_insert_with(|| (type_info, CacheStat::default()));
        f(stat);
    }

    /// Record one successful access
    pub fn record_access(&self, type_info: TypeInfo, kind: AccessKind) {
        self.update(type_info, |stat| {
            stat.access_count += 1;
            match kind {
                AccessKind::FromMemory => stat.from_mem_count += 1,
                AccessKind::LoadFile => stat.load_file_count += 1,
                AccessKind::Created => stat.create_count += 1,
            }
        });
    }

    pub fn record_delete(&self, type_info: TypeInfo, count: u64) {
        self.update(type_info, |stat| stat.del_count += count);
    }

    pub fn record_eviction(&self, type_info: TypeInfo, count: u64) {
        self.update(type_info, |stat| stat.evict_count += count);
    }

    pub fn record_persist_error(&self, type_info: TypeInfo) {
        self.update(type_info, |stat| stat.persist_error_count += 1);
    }

    /// Counters for one type
    pub fn stat_of(&self, type_info: TypeInfo) -> CacheStat {
        self.by_type
            .lock()
            .get(&type_info.id())
            .map(|(_, stat)| *stat)
            .unwrap_or_default()
    }

    /// Aggregate and per-type counters from one consistent copy
    pub fn snapshot(&self) -> StatSnapshot {
        let by_type: Vec<(TypeInfo, CacheStat)> =
            self.by_type.lock().values().copied().collect();

        let mut total = CacheStat::default();
        for (_, stat) in &by_type {
            total += *stat;
        }

        let mut by_type = by_type;
        by_type.sort_by_key(|(info, _)| info.name());
        StatSnapshot { total, by_type }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.by_type.lock().clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
