//! Cache entry metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Compression algorithm.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Zstd,
    Gzip,
    Lz4,
}

impl std::str::FromStr for CompressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "zstd" => Ok(CompressionType::Zstd),
            "gzip" | "gz" => Ok(CompressionType::Gzip),
            "lz4" => Ok(CompressionType::Lz4),
            other => Err(format!("unknown compression: {}", other)),
        }
    }
}

/// Sidecar metadata for a stored cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Original (unsanitized) key.
    pub key: String,
    /// Size of the uncompressed payload.
    pub size_bytes: u64,
    /// Size on disk after compression.
    pub stored_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub compression: CompressionType,
    /// sha256 of the uncompressed payload.
    pub checksum: String,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
