//! Execution environment management.

use async_trait::async_trait;
use conduit_core::context::RunContext;
use conduit_core::run::JobKey;
use conduit_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Trait for execution environments.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Prepare an empty working directory.
    async fn prepare(&self) -> Result<()>;

    /// Get the working directory.
    fn working_dir(&self) -> &Path;

    /// Remove the working directory. Failures are logged, not returned.
    async fn cleanup(&self);
}

/// Host environment: a private directory under the run's workspace root.
pub struct HostEnvironment {
    workspace: PathBuf,
}

impl HostEnvironment {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    /// `<workspace_root>/<run_id>/<job slug>`
    pub fn for_job(ctx: &RunContext, key: &JobKey) -> Self {
        Self::new(ctx.run_workspace().join(key.slug()))
    }
}

#[async_trait]
impl Environment for HostEnvironment {
    async fn prepare(&self) -> Result<()> {
        info!(workspace = %self.workspace.display(), "Preparing host environment");
        if self.workspace.exists() {
            tokio::fs::remove_dir_all(&self.workspace)
                .await
                .map_err(|e| Error::Workspace(format!("failed to clear {}: {}", self.workspace.display(), e)))?;
        }
        tokio::fs::create_dir_all(&self.workspace)
            .await
            .map_err(|e| Error::Workspace(format!("failed to create {}: {}", self.workspace.display(), e)))
    }

    fn working_dir(&self) -> &Path {
        &self.workspace
    }

    async fn cleanup(&self) {
        if self.workspace.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&self.workspace).await
        {
            warn!(path = %self.workspace.display(), error = %e, "Failed to cleanup workspace");
        }
    }
}
