//! Error types for Conduit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Pipeline definition rejected: {0}")]
    Definition(String),

    // Artifact errors
    #[error("Artifact not found: {job}/{name}")]
    ArtifactNotFound { job: String, name: String },

    #[error("Artifact already exists: {job}/{name}")]
    ArtifactExists { job: String, name: String },

    #[error("Artifact path missing in workspace: {0}")]
    ArtifactPathMissing(String),

    // Cache errors
    #[error("Cache write failed: {0}")]
    CacheWriteFailed(String),

    // Step errors
    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timeout after {seconds} seconds")]
    StepTimeout { seconds: u64 },

    #[error("Failed to spawn step process: {0}")]
    Spawn(String),

    // Run errors
    #[error("Run cancelled")]
    Cancelled,

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Compression error: {0}")]
    Compression(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidPipeline(err.to_string())
    }
}

impl Error {
    /// Whether the error means a requested artifact does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ArtifactNotFound { .. })
    }
}
