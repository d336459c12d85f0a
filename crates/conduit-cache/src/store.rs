//! Cache stores.
//!
//! A cache is best-effort: unreadable, expired or corrupt entries are
//! reported as misses and never fail the caller.

use crate::compression::{compress, decompress};
use crate::keys::{digest, matches_prefix, sanitize_key};
use crate::types::{CacheEntry, CompressionType};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use conduit_core::ports::CacheStore;
use conduit_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const DATA_EXT: &str = "bin";
const META_EXT: &str = "json";

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

/// Disk-backed cache: `<root>/<sanitized key>.bin` plus a JSON sidecar.
pub struct FilesystemCacheStore {
    root: PathBuf,
    compression: CompressionType,
    ttl: Option<Duration>,
}

impl FilesystemCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression: CompressionType::default(),
            ttl: None,
        }
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_ttl_days(mut self, days: u32) -> Self {
        self.ttl = (days > 0).then(|| Duration::days(i64::from(days)));
        self
    }

    /// Platform cache directory, falling back to the temp dir.
    pub fn default_root() -> PathBuf {
        directories::ProjectDirs::from("dev", "conduit", "conduit")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("conduit").join("cache"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let base = sanitize_key(key);
        (
            self.root.join(format!("{}.{}", base, DATA_EXT)),
            self.root.join(format!("{}.{}", base, META_EXT)),
        )
    }

    async fn read_entry(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (data_path, meta_path) = self.paths(key);
        let meta = match tokio::fs::read(&meta_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_slice(&meta)?;
        if entry.key != key {
            // Two keys sanitized to the same file name.
            return Ok(None);
        }
        if entry.is_expired(Utc::now()) {
            debug!(key, "Cache entry expired");
            self.remove(key).await?;
            return Ok(None);
        }

        let stored = tokio::fs::read(&data_path).await?;
        let bytes = decompress(&stored, entry.compression)?;
        if digest(&bytes) != entry.checksum {
            return Err(Error::Compression(format!("checksum mismatch for cache key {}", key)));
        }
        Ok(Some(bytes))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let (data_path, meta_path) = self.paths(key);
        for path in [meta_path, data_path] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Entries whose key starts with `prefix`, sorted by key.
    pub async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir_entry) = read_dir.next_entry().await? {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            let meta = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CacheEntry>(&meta) {
                Ok(entry) if matches_prefix(&entry.key, prefix) => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Delete entries whose key starts with `prefix`. Returns how many were removed.
    pub async fn clear(&self, prefix: &str) -> Result<usize> {
        let entries = self.list(prefix).await?;
        for entry in &entries {
            self.remove(&entry.key).await?;
        }
        Ok(entries.len())
    }

    /// Delete every expired entry. Returns how many were removed.
    pub async fn prune_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for entry in self.list("").await? {
            if entry.is_expired(now) {
                self.remove(&entry.key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for FilesystemCacheStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.read_entry(key).await {
            Ok(Some(bytes)) => {
                debug!(key, size = bytes.len(), "Cache hit");
                Some(bytes)
            }
            Ok(None) => {
                debug!(key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::CacheWriteFailed(format!("{}: {}", self.root.display(), e)))?;

        let stored = compress(&bytes, self.compression)?;
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
            stored_bytes: stored.len() as u64,
            created_at: now,
            expires_at: self.ttl.map(|ttl| now + ttl),
            compression: self.compression,
            checksum: digest(&bytes),
        };

        let (data_path, meta_path) = self.paths(key);
        let tmp = data_path.with_extension(format!("{}.tmp", DATA_EXT));
        let write = async {
            tokio::fs::write(&tmp, &stored).await?;
            tokio::fs::rename(&tmp, &data_path).await?;
            tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&entry)?).await?;
            Ok::<(), Error>(())
        };
        write
            .await
            .map_err(|e| Error::CacheWriteFailed(format!("{}: {}", key, e)))?;

        debug!(key, size = entry.size_bytes, stored = entry.stored_bytes, "Cache saved");
        Ok(())
    }
}
