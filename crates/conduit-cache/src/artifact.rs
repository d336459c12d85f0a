//! Artifact stores.
//!
//! An artifact is put exactly once per run and every fetch returns an
//! independent copy of its bytes.

use crate::keys::{digest, encode_segment};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conduit_core::ports::ArtifactStore;
use conduit_core::run::{ArtifactHandle, ArtifactRef};
use conduit_core::{Error, Result, RunId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const DATA_FILE: &str = "data";
const META_FILE: &str = "meta.json";
const MANIFEST_FILE: &str = "run.json";

/// In-process artifact store for a single run.
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<HashMap<ArtifactRef, (ArtifactHandle, Vec<u8>)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, job: &str, name: &str, bytes: Vec<u8>) -> Result<ArtifactHandle> {
        let reference = ArtifactRef::new(job, name);
        let mut entries = self.entries.write().await;
        if entries.contains_key(&reference) {
            return Err(Error::ArtifactExists {
                job: job.to_string(),
                name: name.to_string(),
            });
        }

        let handle = ArtifactHandle {
            reference: reference.clone(),
            size_bytes: bytes.len() as u64,
            sha256: digest(&bytes),
            created_at: Utc::now(),
        };
        debug!(artifact = %reference, size = handle.size_bytes, "Stored artifact");
        entries.insert(reference, (handle.clone(), bytes));
        Ok(handle)
    }

    async fn fetch(&self, job: &str, name: &str) -> Result<Vec<u8>> {
        let entries = self.entries.read().await;
        entries
            .get(&ArtifactRef::new(job, name))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| Error::ArtifactNotFound {
                job: job.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<ArtifactHandle>> {
        let entries = self.entries.read().await;
        let mut handles: Vec<ArtifactHandle> = entries.values().map(|(h, _)| h.clone()).collect();
        handles.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(handles)
    }

    async fn finalize_run(&self) -> Result<()> {
        Ok(())
    }
}

/// Written once the run that owns the directory has finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunManifest {
    run_id: String,
    finalized_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Artifacts retained on disk for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunArtifacts {
    pub run_id: String,
    pub finalized_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub artifacts: Vec<ArtifactHandle>,
}

/// Disk-backed store laid out as `<root>/<run_id>/<job>/<name>/{data,meta.json}`.
pub struct FilesystemArtifactStore {
    root: PathBuf,
    run_id: RunId,
    retention_days: u32,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>, run_id: RunId, retention_days: u32) -> Self {
        Self {
            root: root.into(),
            run_id,
            retention_days,
        }
    }

    /// Platform data directory, falling back to the temp dir.
    pub fn default_root() -> PathBuf {
        directories::ProjectDirs::from("dev", "conduit", "conduit")
            .map(|dirs| dirs.data_dir().join("artifacts"))
            .unwrap_or_else(|| std::env::temp_dir().join("conduit").join("artifacts"))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(self.run_id.to_string())
    }

    fn artifact_dir(&self, job: &str, name: &str) -> PathBuf {
        self.run_dir().join(encode_segment(job)).join(encode_segment(name))
    }

    /// Every run directory under `root`, newest first.
    pub async fn list_runs(root: &Path) -> Result<Vec<RunArtifacts>> {
        let mut runs = Vec::new();
        for run_dir in subdirectories(root).await? {
            let manifest = read_manifest(&run_dir).await;
            runs.push(RunArtifacts {
                run_id: dir_name(&run_dir),
                finalized_at: manifest.as_ref().map(|m| m.finalized_at),
                expires_at: manifest.as_ref().map(|m| m.expires_at),
                artifacts: read_handles(&run_dir).await?,
            });
        }
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(runs)
    }

    /// Remove finalized runs whose retention has expired. Returns the removed run ids.
    pub async fn prune_expired(root: &Path, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut pruned = Vec::new();
        for run_dir in subdirectories(root).await? {
            let Some(manifest) = read_manifest(&run_dir).await else {
                continue;
            };
            if manifest.expires_at <= now {
                tokio::fs::remove_dir_all(&run_dir).await?;
                info!(run_id = %manifest.run_id, "Pruned expired artifacts");
                pruned.push(manifest.run_id);
            }
        }
        Ok(pruned)
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn put(&self, job: &str, name: &str, bytes: Vec<u8>) -> Result<ArtifactHandle> {
        let dir = self.artifact_dir(job, name);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Creating the directory claims the ref.
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::ArtifactExists {
                    job: job.to_string(),
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let handle = ArtifactHandle {
            reference: ArtifactRef::new(job, name),
            size_bytes: bytes.len() as u64,
            sha256: digest(&bytes),
            created_at: Utc::now(),
        };
        if let Err(e) = write_artifact(&dir, &handle, &bytes).await {
            // Release the claim so the ref can be put again.
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %cleanup, "Failed to remove partial artifact");
            }
            return Err(e);
        }

        debug!(artifact = %handle.reference, size = handle.size_bytes, "Stored artifact");
        Ok(handle)
    }

    async fn fetch(&self, job: &str, name: &str) -> Result<Vec<u8>> {
        let not_found = || Error::ArtifactNotFound {
            job: job.to_string(),
            name: name.to_string(),
        };
        let dir = self.artifact_dir(job, name);
        let Some(handle) = read_handle(&dir).await? else {
            return Err(not_found());
        };
        if handle.reference != ArtifactRef::new(job, name) {
            return Err(not_found());
        }
        match tokio::fs::read(dir.join(DATA_FILE)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ArtifactHandle>> {
        read_handles(&self.run_dir()).await
    }

    async fn finalize_run(&self) -> Result<()> {
        let run_dir = self.run_dir();
        tokio::fs::create_dir_all(&run_dir).await?;

        let now = Utc::now();
        let manifest = RunManifest {
            run_id: self.run_id.to_string(),
            finalized_at: now,
            expires_at: now + Duration::days(i64::from(self.retention_days)),
        };
        tokio::fs::write(run_dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?).await?;
        info!(
            run_id = %self.run_id,
            expires_at = %manifest.expires_at,
            "Finalized run artifacts"
        );
        Ok(())
    }
}

async fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn read_manifest(run_dir: &Path) -> Option<RunManifest> {
    let bytes = tokio::fs::read(run_dir.join(MANIFEST_FILE)).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(dir = %run_dir.display(), error = %e, "Unreadable run manifest");
            None
        }
    }
}

/// Data first, metadata last: an artifact is complete once `meta.json` exists.
async fn write_artifact(dir: &Path, handle: &ArtifactHandle, bytes: &[u8]) -> Result<()> {
    let data_tmp = dir.join(format!("{}.tmp", DATA_FILE));
    tokio::fs::write(&data_tmp, bytes).await?;
    tokio::fs::rename(&data_tmp, dir.join(DATA_FILE)).await?;

    let meta_tmp = dir.join(format!("{}.tmp", META_FILE));
    tokio::fs::write(&meta_tmp, serde_json::to_vec_pretty(handle)?).await?;
    tokio::fs::rename(&meta_tmp, dir.join(META_FILE)).await?;
    Ok(())
}

async fn read_handle(artifact_dir: &Path) -> Result<Option<ArtifactHandle>> {
    match tokio::fs::read(artifact_dir.join(META_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_handles(run_dir: &Path) -> Result<Vec<ArtifactHandle>> {
    let mut handles = Vec::new();
    for job_dir in subdirectories(run_dir).await? {
        for artifact_dir in subdirectories(&job_dir).await? {
            // Half-written artifacts have no metadata yet.
            if let Some(handle) = read_handle(&artifact_dir).await? {
                handles.push(handle);
            }
        }
    }
    handles.sort_by(|a, b| a.reference.cmp(&b.reference));
    Ok(handles)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_put_once() {
        let store = MemoryArtifactStore::new();
        let handle = store.put("build", "core", b"binary".to_vec()).await.unwrap();
        assert_eq!(handle.size_bytes, 6);

        let err = store.put("build", "core", b"other".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactExists { .. }));
        assert_eq!(store.fetch("build", "core").await.unwrap(), b"binary");
    }

    #[tokio::test]
    async fn test_memory_store_fetch_missing() {
        let store = MemoryArtifactStore::new();
        let err = store.fetch("build", "core").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_filesystem_store_layout() {
        let root = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = FilesystemArtifactStore::new(root.path(), run_id, 30);

        let payload: Vec<u8> = (0..=255u8).collect();
        let handle = store.put("build", "core-ubuntu", payload.clone()).await.unwrap();
        assert_eq!(handle.sha256, digest(&payload));

        let dir = root.path().join(run_id.to_string()).join("build").join("core-ubuntu");
        assert!(dir.join(DATA_FILE).exists());
        assert!(dir.join(META_FILE).exists());

        assert_eq!(store.fetch("build", "core-ubuntu").await.unwrap(), payload);
        assert!(store.put("build", "core-ubuntu", vec![1]).await.is_err());
        assert!(store.fetch("build", "core-macos").await.unwrap_err().is_not_found());

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![handle]);
    }

    #[tokio::test]
    async fn test_filesystem_store_keeps_similar_names_apart() {
        let root = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(root.path(), RunId::new(), 30);

        store.put("build", "bin/app", b"first".to_vec()).await.unwrap();
        assert!(store.fetch("build", "bin_app").await.unwrap_err().is_not_found());
        assert!(store.fetch("build", "bin:app").await.unwrap_err().is_not_found());

        store.put("build", "bin_app", b"second".to_vec()).await.unwrap();
        assert_eq!(store.fetch("build", "bin/app").await.unwrap(), b"first");
        assert_eq!(store.fetch("build", "bin_app").await.unwrap(), b"second");

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.reference.name)
            .collect();
        assert_eq!(names, vec!["bin/app".to_string(), "bin_app".to_string()]);
    }

    #[tokio::test]
    async fn test_filesystem_store_ignores_half_written_artifact() {
        let root = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(root.path(), RunId::new(), 30);
        store.put("build", "core", b"complete".to_vec()).await.unwrap();

        // Data landed but the metadata write never happened.
        let partial = store.artifact_dir("build", "report");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join(DATA_FILE), b"partial").unwrap();

        assert!(store.fetch("build", "report").await.unwrap_err().is_not_found());
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reference, ArtifactRef::new("build", "core"));
    }

    #[tokio::test]
    async fn test_prune_expired_runs() {
        let root = tempfile::tempdir().unwrap();

        let expired = FilesystemArtifactStore::new(root.path(), RunId::new(), 0);
        expired.put("build", "core", vec![1, 2, 3]).await.unwrap();
        expired.finalize_run().await.unwrap();

        let retained = FilesystemArtifactStore::new(root.path(), RunId::new(), 30);
        retained.put("build", "core", vec![4, 5, 6]).await.unwrap();
        retained.finalize_run().await.unwrap();

        let unfinished = FilesystemArtifactStore::new(root.path(), RunId::new(), 0);
        unfinished.put("build", "core", vec![7]).await.unwrap();

        let pruned = FilesystemArtifactStore::prune_expired(root.path(), Utc::now())
            .await
            .unwrap();
        assert_eq!(pruned, vec![expired.run_dir().file_name().unwrap().to_string_lossy().to_string()]);
        assert!(!expired.run_dir().exists());
        assert!(retained.run_dir().exists());
        assert!(unfinished.run_dir().exists());

        let runs = FilesystemArtifactStore::list_runs(root.path()).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| run.artifacts.len() == 1));
    }
}
