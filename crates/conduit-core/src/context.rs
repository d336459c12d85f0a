//! Per-run context shared by the scheduler and every job executor.

use crate::ids::RunId;
use crate::interpolation;
use crate::pipeline::{PipelineDefinition, TriggerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The event that started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: TriggerType,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

impl TriggerEvent {
    pub fn manual() -> Self {
        Self {
            kind: TriggerType::Manual,
            branch: None,
            sha: None,
            tag: None,
        }
    }

    pub fn push(branch: impl Into<String>) -> Self {
        Self {
            kind: TriggerType::Push,
            branch: Some(branch.into()),
            sha: None,
            tag: None,
        }
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }
}

impl Default for TriggerEvent {
    fn default() -> Self {
        Self::manual()
    }
}

/// Immutable run metadata plus the teardown guard.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub pipeline: String,
    pub trigger: TriggerEvent,
    /// Global variables: pipeline variables overlaid with run overrides.
    pub variables: HashMap<String, String>,
    /// Injected as environment and masked in captured output.
    pub secrets: HashMap<String, String>,
    pub workspace_root: PathBuf,
    pub grace_period: Duration,
    pub default_step_timeout: Duration,
    pub keep_workspaces: bool,
    pub started_at: DateTime<Utc>,
    torn_down: AtomicBool,
}

impl RunContext {
    pub fn builder(definition: &PipelineDefinition) -> RunContextBuilder {
        RunContextBuilder::new(definition)
    }

    /// Directory holding every job workspace of this run.
    pub fn run_workspace(&self) -> PathBuf {
        self.workspace_root.join(self.run_id.to_string())
    }

    /// Variables every step receives before job, matrix and step overlays.
    pub fn base_env(&self) -> HashMap<String, String> {
        let mut env = self.variables.clone();
        env.extend(self.secrets.clone());
        env.insert("CI".to_string(), "true".to_string());
        env.insert("CONDUIT_RUN_ID".to_string(), self.run_id.to_string());
        env.insert("CONDUIT_PIPELINE".to_string(), self.pipeline.clone());
        env.insert("CONDUIT_EVENT".to_string(), self.trigger.kind.to_string());
        if let Some(branch) = &self.trigger.branch {
            env.insert("CONDUIT_BRANCH".to_string(), branch.clone());
        }
        if let Some(sha) = &self.trigger.sha {
            env.insert("CONDUIT_SHA".to_string(), sha.clone());
        }
        if let Some(tag) = &self.trigger.tag {
            env.insert("CONDUIT_TAG".to_string(), tag.clone());
        }
        env
    }

    /// Mask secret values in a line of output.
    pub fn mask(&self, line: &str) -> String {
        interpolation::mask(line, self.secrets.values())
    }

    /// Returns `true` only for the first caller.
    pub fn teardown(&self) -> bool {
        self.torn_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

pub struct RunContextBuilder {
    pipeline: String,
    trigger: TriggerEvent,
    variables: HashMap<String, String>,
    secrets: HashMap<String, String>,
    workspace_root: PathBuf,
    grace_period: Duration,
    default_step_timeout: Duration,
    keep_workspaces: bool,
    run_id: Option<RunId>,
}

impl RunContextBuilder {
    fn new(definition: &PipelineDefinition) -> Self {
        Self {
            pipeline: definition.name.clone(),
            trigger: TriggerEvent::manual(),
            variables: definition.variables.clone(),
            secrets: HashMap::new(),
            workspace_root: std::env::temp_dir().join("conduit"),
            grace_period: Duration::from_secs(10),
            default_step_timeout: Duration::from_secs(1800),
            keep_workspaces: false,
            run_id: None,
        }
    }

    pub fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn trigger(mut self, trigger: TriggerEvent) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    pub fn build(self) -> RunContext {
        RunContext {
            run_id: self.run_id.unwrap_or_default(),
            pipeline: self.pipeline,
            trigger: self.trigger,
            variables: self.variables,
            secrets: self.secrets,
            workspace_root: self.workspace_root,
            grace_period: self.grace_period,
            default_step_timeout: self.default_step_timeout,
            keep_workspaces: self.keep_workspaces,
            started_at: Utc::now(),
            torn_down: AtomicBool::new(false),
        }
    }
}
