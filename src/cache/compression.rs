//! Blob Compression
//!
//! LZ4 compression for persisted blobs. Every blob starts with a one-byte
//! algorithm tag so compressed and plain files read back the same way.

use super::MIN_COMPRESS_SIZE;
use crate::error::{Error, Result};

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// No compression
    #[default]
    None,
    /// LZ4 - fast compression
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Frame a payload with its algorithm tag, compressing when asked and useful
pub fn encode(payload: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    let algorithm = if payload.len() < MIN_COMPRESS_SIZE {
        CompressionAlgorithm::None
    } else {
        algorithm
    };

    let body = match algorithm {
        CompressionAlgorithm::None => payload.to_vec(),
        CompressionAlgorithm::Lz4 => lz4::block::compress(
            payload,
            Some(lz4::block::CompressionMode::DEFAULT),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })?,
    };

    let mut framed = Vec::with_capacity(body.len() + 1);
    framed.push(algorithm.tag());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Strip the algorithm tag and decompress
pub fn decode(framed: &[u8]) -> Result<Vec<u8>> {
    let (&tag, body) = framed.split_first().ok_or_else(|| Error::DecompressionFailed {
        algorithm: "unknown".into(),
        reason: "empty blob".into(),
    })?;

    match CompressionAlgorithm::from_tag(tag) {
        Some(CompressionAlgorithm::None) => Ok(body.to_vec()),
        Some(CompressionAlgorithm::Lz4) => {
            lz4::block::decompress(body, None).map_err(|e| Error::DecompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            })
        }
        None => Err(Error::DecompressionFailed {
            algorithm: "unknown".into(),
            reason: format!("unrecognized algorithm tag {tag}"),
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
