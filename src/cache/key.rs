//! Cache Keys
//!
//! Composite string keys scoped per value type.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ordered, non-empty sequence of strings identifying one cached value
#[derive(Clone, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CacheKey {
    /// Pre-computed hash of all parts (for fast comparison and sharding)
    hash: u64,
    /// Key parts in caller order
    parts: Vec<String>,
}

impl CacheKey {
    /// Create a new cache key, rejecting an empty sequence
    pub fn new<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            return Err(Error::InvalidKey("key sequence must not be empty".into()));
        }

        let hash = Self::hash_parts(&parts);
        Ok(Self { hash, parts })
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    pub(crate) fn fx_hash(seed: u64, bytes: &[u8]) -> u64 {
        const K: u64 = 0x517cc1b727220a95;
        let mut hash = seed;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(K);
        }
        hash
    }

    fn hash_parts(parts: &[String]) -> u64 {
        // Mix in the part length so ["ab", "c"] and ["a", "bc"] differ
        parts.iter().fold(0x517cc1b727220a95, |acc, part| {
            let acc = Self::fx_hash(acc, &(part.len() as u64).to_le_bytes());
            Self::fx_hash(acc, part.as_bytes())
        })
    }

    /// Key parts in order
    #[inline]
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Number of parts
    #[inline]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Always false; keys are never empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Pre-computed hash of the key parts
    #[inline]
    pub fn combined_hash(&self) -> u64 {
        self.hash
    }

    /// Get the shard index for this key (0..shard_count)
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        (self.hash as usize) & (shard_count - 1)
    }

    /// Parts joined with `/`, for logs and error messages
    pub fn joined(&self) -> String {
        self.parts.join("/")
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        self.hash == other.hash && self.parts == other.parts
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.parts).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.joined())
    }
}

impl TryFrom<Vec<String>> for CacheKey {
    type Error = Error;

    fn try_from(parts: Vec<String>) -> Result<Self> {
        Self::new(parts)
    }
}

impl TryFrom<&[&str]> for CacheKey {
    type Error = Error;

    fn try_from(parts: &[&str]) -> Result<Self> {
        Self::new(parts.iter().copied())
    }
}

impl<const N: usize> TryFrom<[&str; N]> for CacheKey {
    type Error = Error;

    fn try_from(parts: [&str; N]) -> Result<Self> {
        Self::new(parts)
    }
}

impl From<CacheKey> for Vec<String> {
    fn from(key: CacheKey) -> Self {
        key.parts
    }
}

/// Identity of a cached value type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    id: TypeId,
    name: &'static str,
}

impl TypeInfo {
    /// Type info for `T`
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Rust type id
    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Serialized as the type name
impl Serialize for TypeInfo {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name)
    }
}

/// (type, key) pair identifying one lock slot
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub type_id: TypeId,
    pub key: CacheKey,
}

impl SlotKey {
    pub fn new(type_info: TypeInfo, key: CacheKey) -> Self {
        Self {
            type_id: type_info.id(),
            key,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn key(parts: &[&str]) -> CacheKey {
        CacheKey::try_from(parts).unwrap()
    }

    #[test]
    fn test_empty_key_rejected() {
        let empty: Vec<String> = Vec::new();
        assert_matches!(CacheKey::new(empty), Err(Error::InvalidKey(_)));
    }

    #[test]
    fn test_key_order_is_significant() {
        assert_ne!(key(&["a", "b"]), key(&["b", "a"]));
        assert_eq!(key(&["a", "b"]), key(&["a", "b"]));
    }

    #[test]
    fn test_part_boundaries_matter() {
        assert_ne!(key(&["ab", "c"]), key(&["a", "bc"]));
        assert_ne!(
            key(&["ab", "c"]).combined_hash(),
            key(&["a", "bc"]).combined_hash()
        );
    }

    #[test]
    fn test_joined_and_display() {
        let k = key(&["region", "42"]);
        assert_eq!(k.joined(), "region/42");
        assert_eq!(format!("{}", k), "region/42");
        assert_eq!(k.len(), 2);
    }

    #[test]
    fn test_serde_round_trip_rejects_empty() {
        let k = key(&["x", "y"]);
        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, r#"["x","y"]"#);
        assert!(serde_json::from_str::<CacheKey>("[]").is_err());
    }

    #[test]
    fn test_type_info_distinguishes_types() {
        assert_ne!(TypeInfo::of::<String>(), TypeInfo::of::<u64>());
        assert_eq!(TypeInfo::of::<u64>().name(), "u64");
    }

    #[test]
    fn test_shard_index_in_range() {
        let k = key(&["shard", "me"]);
        assert!(k.shard_index(16) < 16);
    }

    proptest! {
        #[test]
        fn prop_equal_parts_equal_keys(parts in proptest::collection::vec(".{0,8}", 1..5)) {
            let a = CacheKey::new(parts.clone()).unwrap();
            let b = CacheKey::new(parts).unwrap();
            prop_assert_eq!(a.combined_hash(), b.combined_hash());
            prop_assert_eq!(a, b);
        }
    }
}
