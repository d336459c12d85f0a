//! Moving workspace paths in and out of the stores.
//!
//! Artifacts and cache entries travel as tar archives so that a producer
//! and a consumer never share a filesystem path.

use crate::archiver;
use crate::types::CompressionType;
use conduit_core::ports::{ArtifactStore, CacheStore};
use conduit_core::run::ArtifactHandle;
use conduit_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

async fn pack(workspace: &Path, path: &str, compression: CompressionType) -> Result<Vec<u8>> {
    let workspace = workspace.to_path_buf();
    let path = PathBuf::from(path);
    tokio::task::spawn_blocking(move || archiver::pack(&workspace, &[path], compression))
        .await
        .map_err(|e| Error::Internal(format!("archive task failed: {}", e)))?
}

async fn unpack(data: Vec<u8>, dest: &Path, compression: CompressionType) -> Result<()> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || archiver::unpack(&data, &dest, compression))
        .await
        .map_err(|e| Error::Internal(format!("extract task failed: {}", e)))?
}

#[derive(Clone)]
pub struct ArtifactTransport {
    store: Arc<dyn ArtifactStore>,
    compression: CompressionType,
}

impl ArtifactTransport {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            compression: CompressionType::Zstd,
        }
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Archive `path` (relative to `workspace`) and put it as `job/name`.
    pub async fn upload(
        &self,
        job: &str,
        name: &str,
        workspace: &Path,
        path: &str,
    ) -> Result<ArtifactHandle> {
        let data = pack(workspace, path, self.compression).await?;
        let handle = self.store.put(job, name, data).await?;
        debug!(artifact = %handle.reference, path, "Uploaded artifact");
        Ok(handle)
    }

    /// Fetch `job/name` and extract it under `dest`. Returns the archive size.
    pub async fn download(&self, job: &str, name: &str, dest: &Path) -> Result<u64> {
        let data = self.store.fetch(job, name).await?;
        let size = data.len() as u64;
        unpack(data, dest, self.compression).await?;
        debug!(job, name, dest = %dest.display(), "Downloaded artifact");
        Ok(size)
    }
}

/// Archives are stored uncompressed; the cache store applies its own compression.
#[derive(Clone)]
pub struct CacheTransport {
    store: Arc<dyn CacheStore>,
}

impl CacheTransport {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Extract the entry for `key` into `workspace`. Returns `false` on a miss.
    pub async fn restore(&self, key: &str, workspace: &Path) -> Result<bool> {
        match self.store.get(key).await {
            Some(data) => {
                unpack(data, workspace, CompressionType::None).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Archive `path` (relative to `workspace`) under `key`.
    pub async fn save(&self, key: &str, workspace: &Path, path: &str) -> Result<()> {
        let data = pack(workspace, path, CompressionType::None).await?;
        self.store.put(key, data).await
    }
}
