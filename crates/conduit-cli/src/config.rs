//! Engine configuration.
//!
//! Looked up in order: an explicit `--config` path, `conduit.config.yaml`
//! in the working directory, then `config.yaml` in the user config dir.
//! Missing files fall back to defaults; command-line flags override last.

use conduit_cache::{CompressionType, FilesystemArtifactStore, FilesystemCacheStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const LOCAL_CONFIG_FILE: &str = "conduit.config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    /// Concurrency limit per `resource_class`.
    pub resource_limits: HashMap<String, usize>,
    pub grace_period_secs: u64,
    pub default_step_timeout_secs: u64,
    pub workspace_root: Option<PathBuf>,
    pub artifact_root: Option<PathBuf>,
    pub cache_root: Option<PathBuf>,
    /// Overrides the pipeline's own `artifacts.retention_days`.
    pub artifact_retention_days: Option<u32>,
    pub cache_ttl_days: u32,
    pub keep_workspaces: bool,
    pub cache_compression: CompressionType,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            resource_limits: HashMap::new(),
            grace_period_secs: 10,
            default_step_timeout_secs: 1800,
            workspace_root: None,
            artifact_root: None,
            cache_root: None,
            artifact_retention_days: None,
            cache_ttl_days: 7,
            keep_workspaces: false,
            cache_compression: CompressionType::Zstd,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the first file found.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::from_file(&local);
        }

        match Self::user_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the user configuration file path.
    pub fn user_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "conduit", "conduit")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".to_string()));
        }
        if let Some((class, _)) = self.resource_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::Invalid(format!(
                "resource limit for '{}' must be at least 1",
                class
            )));
        }
        Ok(())
    }

    pub fn with_concurrency(mut self, concurrency: Option<usize>) -> Self {
        if let Some(concurrency) = concurrency {
            self.max_concurrency = concurrency.max(1);
        }
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("conduit").join("workspaces"))
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.artifact_root
            .clone()
            .unwrap_or_else(FilesystemArtifactStore::default_root)
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_root
            .clone()
            .unwrap_or_else(FilesystemCacheStore::default_root)
    }
}
