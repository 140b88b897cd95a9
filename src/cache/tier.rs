//! Persistence Tiers
//!
//! Where a built value lives besides the entry store. Chosen per entry at
//! creation time and fixed for the entry's lifetime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Persistence tier of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Resident only, lost on process exit
    #[default]
    MemoryOnly,
    /// Resident, mirrored under the temp directory, removed at shutdown
    MemoryAndTempDir,
    /// Resident, mirrored under the persistent directory, survives restarts
    MemoryAndPersist,
    /// Never resident after creation, every access reads the persistent file
    PersistOnly,
}

/// Directory class a tier writes its blob into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRoot {
    Temp,
    Persist,
}

impl Tier {
    /// All tiers, in durability order
    pub const ALL: [Tier; 4] = [
        Tier::MemoryOnly,
        Tier::MemoryAndTempDir,
        Tier::MemoryAndPersist,
        Tier::PersistOnly,
    ];

    /// Directory class for the mirror file, if the tier writes one
    pub fn storage_root(&self) -> Option<StorageRoot> {
        match self {
            Tier::MemoryOnly => None,
            Tier::MemoryAndTempDir => Some(StorageRoot::Temp),
            Tier::MemoryAndPersist | Tier::PersistOnly => Some(StorageRoot::Persist),
        }
    }

    /// Whether the value stays resident after creation
    #[inline]
    pub fn keeps_resident(&self) -> bool {
        !matches!(self, Tier::PersistOnly)
    }

    /// Whether the resident copy can be dropped without losing the value
    #[inline]
    pub fn is_droppable(&self) -> bool {
        self.storage_root().is_some()
    }

    /// Whether a file from a previous process may be reused
    #[inline]
    pub fn survives_restart(&self) -> bool {
        self.storage_root() == Some(StorageRoot::Persist)
    }

    /// Short name used in configs and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            Tier::MemoryOnly => "memory_only",
            Tier::MemoryAndTempDir => "memory_and_temp_dir",
            Tier::MemoryAndPersist => "memory_and_persist",
            Tier::PersistOnly => "persist_only",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::MemoryOnly => write!(f, "Memory"),
            Tier::MemoryAndTempDir => write!(f, "Memory + Temp"),
            Tier::MemoryAndPersist => write!(f, "Memory + Persist"),
            Tier::PersistOnly => write!(f, "Persist"),
        }
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Tier::ALL
            .into_iter()
            .find(|tier| tier.name() == normalized)
            .ok_or_else(|| Error::Config(format!("unknown persistence tier: {s}")))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_storage_roots() {
        assert_eq!(Tier::MemoryOnly.storage_root(), None);
        assert_eq!(Tier::MemoryAndTempDir.storage_root(), Some(StorageRoot::Temp));
        assert_eq!(Tier::MemoryAndPersist.storage_root(), Some(StorageRoot::Persist));
        assert_eq!(Tier::PersistOnly.storage_root(), Some(StorageRoot::Persist));
    }

    #[test]
    fn test_tier_residency() {
        assert!(Tier::MemoryOnly.keeps_resident());
        assert!(!Tier::MemoryOnly.is_droppable());
        assert!(!Tier::PersistOnly.keeps_resident());
        assert!(Tier::MemoryAndTempDir.is_droppable());
        assert!(!Tier::MemoryAndTempDir.survives_restart());
        assert!(Tier::MemoryAndPersist.survives_restart());
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("persist-only".parse::<Tier>().unwrap(), Tier::PersistOnly);
        assert_eq!(
            "Memory_And_Temp_Dir".parse::<Tier>().unwrap(),
            Tier::MemoryAndTempDir
        );
        assert!("disk".parse::<Tier>().is_err());
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(format!("{}", Tier::MemoryOnly), "Memory");
        assert_eq!(format!("{}", Tier::MemoryAndPersist), "Memory + Persist");
    }
}
