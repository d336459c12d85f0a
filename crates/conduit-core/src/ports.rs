//! Port traits.
//!
//! These traits define the interfaces between the scheduling core and the
//! adapters that store artifacts, cache state and run jobs.

use crate::context::RunContext;
use crate::pipeline::JobTemplate;
use crate::run::{ArtifactHandle, JobKey, JobOutcome};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use crate::events::EventSink;

/// Run-scoped store of named blobs passed between jobs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact. Fails with `ArtifactExists` if the ref was already put.
    async fn put(&self, job: &str, name: &str, bytes: Vec<u8>) -> Result<ArtifactHandle>;

    /// Fetch an independent copy of an artifact. Fails with `ArtifactNotFound`.
    async fn fetch(&self, job: &str, name: &str) -> Result<Vec<u8>>;

    /// All artifacts stored for the run.
    async fn list(&self) -> Result<Vec<ArtifactHandle>>;

    /// Flush and apply retention once the run has finished.
    async fn finalize_run(&self) -> Result<()>;
}

/// Best-effort keyed cache shared across runs.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `None` is a miss, never an error.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Later writers overwrite earlier ones.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

/// A job instance handed to a runner.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub key: JobKey,
    pub template: Arc<JobTemplate>,
}

/// Executes one job instance to completion.
///
/// Implementations never return errors: every failure is reported through
/// the outcome's `FailureReason`.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        request: JobRequest,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
    ) -> JobOutcome;
}
