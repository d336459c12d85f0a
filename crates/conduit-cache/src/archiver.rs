//! Tar archives of workspace paths.

use crate::compression::{compress, decompress};
use crate::types::CompressionType;
use conduit_core::{Error, Result};
use std::path::{Path, PathBuf};

/// Pack `paths` into a tar archive with entries named relative to `base_dir`.
///
/// Every path must exist; a missing one fails with `ArtifactPathMissing`.
pub fn pack(base_dir: &Path, paths: &[PathBuf], compression: CompressionType) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    for p in paths {
        let abs_path = if p.is_absolute() {
            p.clone()
        } else {
            base_dir.join(p)
        };
        if !abs_path.exists() {
            return Err(Error::ArtifactPathMissing(p.display().to_string()));
        }
        let name = abs_path.strip_prefix(base_dir).unwrap_or(p.as_path());

        if abs_path.is_dir() {
            builder
                .append_dir_all(name, &abs_path)
                .map_err(|e| Error::Archive(format!("failed to pack {}: {}", p.display(), e)))?;
        } else {
            builder
                .append_path_with_name(&abs_path, name)
                .map_err(|e| Error::Archive(format!("failed to pack {}: {}", p.display(), e)))?;
        }
    }

    let tarball = builder
        .into_inner()
        .map_err(|e| Error::Archive(format!("failed to finish tar: {}", e)))?;
    compress(&tarball, compression)
}

/// Extract an archive produced by [`pack`] into `dest`.
pub fn unpack(data: &[u8], dest: &Path, compression: CompressionType) -> Result<()> {
    let tarball = decompress(data, compression)?;
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(tarball.as_slice());
    archive
        .unpack(dest)
        .map_err(|e| Error::Archive(format!("failed to unpack into {}: {}", dest.display(), e)))
}
