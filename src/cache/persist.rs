//! Persisted Blob Store
//!
//! One serialized blob per (type, key sequence). File identity is derived
//! from the type name and the joined key so a restarted process can find
//! the blob again:
//!
//! ```text
//! <dir>/<encoded type name>/<encoded part>+<encoded part>.cache
//! ```
//!
//! Long identities fall back to a hashed name; the blob envelope carries the
//! full key and type name so a hash collision reads back as a missing file.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::compression::{self, CompressionAlgorithm};
use super::key::{CacheKey, TypeInfo};
use super::{MAX_FILE_STEM_LEN, MAX_TYPE_DIR_LEN};
use crate::error::{Error, Result};

/// Extension of persisted blobs
pub const BLOB_EXTENSION: &str = "cache";

#[derive(Serialize)]
struct BlobRef<'a, T> {
    type_name: &'a str,
    keys: &'a [String],
    created_at: DateTime<Utc>,
    value: &'a T,
}

#[derive(Deserialize)]
struct BlobOwned<T> {
    type_name: String,
    keys: Vec<String>,
    created_at: DateTime<Utc>,
    value: T,
}

/// A value read back from disk
#[derive(Debug)]
pub struct LoadedBlob<T> {
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// Compute the blob path for a (type, key) under `dir`
pub fn blob_path(dir: &Path, type_info: TypeInfo, key: &CacheKey) -> PathBuf {
    let type_dir = urlencoding::encode(type_info.name()).into_owned();
    let type_dir = if type_dir.len() > MAX_TYPE_DIR_LEN {
        format!("t{:016x}", CacheKey::fx_hash(0, type_info.name().as_bytes()))
    } else {
        type_dir
    };

    let stem = key
        .parts()
        .iter()
        .map(|part| urlencoding::encode(part).into_owned())
        .collect::<Vec<_>>()
        .join("+");
    let stem = if stem.len() > MAX_FILE_STEM_LEN {
        format!("h{:016x}", key.combined_hash())
    } else {
        stem
    };

    dir.join(type_dir)
        .join(format!("{stem}.{BLOB_EXTENSION}"))
}

/// Serialize and write a blob, returning the number of bytes on disk.
///
/// Writes to a sibling temporary file and renames it into place so readers
/// never observe a half-written blob.
pub fn write_blob<T: Serialize>(
    path: &Path,
    type_info: TypeInfo,
    key: &CacheKey,
    created_at: DateTime<Utc>,
    value: &T,
    algorithm: CompressionAlgorithm,
) -> Result<u64> {
    let envelope = BlobRef {
        type_name: type_info.name(),
        keys: key.parts(),
        created_at,
        value,
    };
    let payload = serde_json::to_vec(&envelope)?;
    let framed = compression::encode(&payload, algorithm)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let staging = path.with_extension(format!("{BLOB_EXTENSION}.{}.tmp", uuid::Uuid::new_v4()));
    let written = (|| {
        let mut file = fs::File::create(&staging)?;
        file.write_all(&framed)?;
        file.sync_all()?;
        fs::rename(&staging, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }

    Ok(framed.len() as u64)
}

/// Read and deserialize a blob.
///
/// A missing file, or a file whose envelope names a different type or key,
/// yields [`Error::PersistedFileMissing`].
pub fn read_blob<T: DeserializeOwned>(
    path: &Path,
    type_info: TypeInfo,
    key: &CacheKey,
) -> Result<LoadedBlob<T>> {
    let framed = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::PersistedFileMissing {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let payload = compression::decode(&framed)?;
    let blob: BlobOwned<T> = serde_json::from_slice(&payload)?;

    if blob.type_name != type_info.name() || blob.keys.as_slice() != key.parts() {
        return Err(Error::PersistedFileMissing {
            path: path.to_path_buf(),
        });
    }

    Ok(LoadedBlob {
        value: blob.value,
        created_at: blob.created_at,
        size: framed.len() as u64,
    })
}

/// Whether a blob file exists at `path`
pub fn blob_exists(path: &Path) -> bool {
    path.is_file()
}

/// Remove a blob; returns false if it did not exist
pub fn remove_blob(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete every blob under `dir` whose path is not in `keep`.
///
/// Walks one level of type directories. Staging files and anything without
/// the blob extension are left alone. Returns the number of files removed.
pub fn remove_all_blobs(dir: &Path, keep: &HashSet<PathBuf>) -> Result<usize> {
    let type_dirs = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for type_dir in type_dirs {
        let type_dir = type_dir?.path();
        if !type_dir.is_dir() {
            continue;
        }
        for file in fs::read_dir(&type_dir)? {
            let path = file?.path();
            let is_blob = path.extension().is_some_and(|ext| ext == BLOB_EXTENSION);
            if is_blob && !keep.contains(&path) && remove_blob(&path)? {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

// =============================================================================
// Tests
// =============================================================================
