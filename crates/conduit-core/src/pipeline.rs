//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration. A
//! definition is parsed once per run and never mutated afterwards.

use crate::{Error, Result};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "env")]
    pub variables: HashMap<String, String>,
    pub jobs: Vec<JobTemplate>,
    #[serde(default)]
    pub artifacts: ArtifactPolicy,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Parse a definition from YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Reject workspace paths that point outside the job workspace.
    pub fn validate(&self) -> Result<()> {
        for job in &self.jobs {
            let mut paths: Vec<(&str, &str)> = Vec::new();
            paths.extend(job.inputs.iter().filter_map(|i| i.path.as_deref()).map(|p| ("input path", p)));
            paths.extend(job.outputs.iter().map(|o| ("output path", o.path.as_str())));
            for cache in &job.caches {
                paths.push(("cache path", cache.path.as_str()));
                paths.extend(cache.hash_files.iter().map(|f| ("cache hash file", f.as_str())));
            }
            paths.extend(
                job.steps
                    .iter()
                    .filter_map(|s| s.working_directory.as_deref())
                    .map(|d| ("working directory", d)),
            );

            if let Some((what, path)) = paths.into_iter().find(|(_, path)| !is_workspace_relative(path)) {
                return Err(Error::InvalidPipeline(format!(
                    "job '{}': {} '{}' must stay inside the workspace",
                    job.name, what, path
                )));
            }
        }
        Ok(())
    }

    /// Look up a job template by name.
    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Declaration index of a job template.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.jobs.iter().position(|job| job.name == name)
    }
}

/// True if `path` is relative and never climbs above its base directory.
pub fn is_workspace_relative(path: &str) -> bool {
    use std::path::Component;

    std::path::Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Retention policy for artifacts produced by a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPolicy {
    #[serde(default = "default_retention")]
    pub retention_days: u32,
}

fn default_retention() -> u32 {
    30
}

impl Default for ArtifactPolicy {
    fn default() -> Self {
        Self {
            retention_days: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub events: Vec<TriggerType>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Push,
    PullRequest,
    Tag,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerType::Manual => "manual",
            TriggerType::Push => "push",
            TriggerType::PullRequest => "pull_request",
            TriggerType::Tag => "tag",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "push" => Ok(TriggerType::Push),
            "pull_request" | "pull-request" | "pr" => Ok(TriggerType::PullRequest),
            "tag" => Ok(TriggerType::Tag),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// A job as declared in the pipeline, before matrix expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default, rename = "on", alias = "triggers")]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default, alias = "env")]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub join: JoinPolicy,
    #[serde(default)]
    pub needs_policy: NeedsPolicy,
    #[serde(default)]
    pub inputs: Vec<ArtifactInput>,
    #[serde(default)]
    pub outputs: Vec<ArtifactOutput>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub resource_class: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl JobTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn matrix(mut self, matrix: MatrixConfig) -> Self {
        self.matrix = Some(matrix);
        self
    }
}

/// How a dependent waits on the matrix instances of a prerequisite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Wait for every instance of the prerequisite.
    #[default]
    All,
    /// Wait only for instances whose shared axis values equal ours.
    Matching,
}

/// Which prerequisite outcomes allow a job to start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedsPolicy {
    /// Every prerequisite succeeded.
    #[default]
    Success,
    /// At least one prerequisite succeeded.
    PartialSuccess,
    /// Every prerequisite is terminal, whatever the outcome.
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub run: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default, alias = "env")]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            shell: default_shell(),
            working_directory: None,
            variables: HashMap::new(),
            continue_on_error: false,
            timeout_seconds: None,
            retry: None,
        }
    }

    /// Whether a failure of this step fails the job.
    pub fn is_fatal(&self) -> bool {
        !self.continue_on_error
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay")]
    pub delay_seconds: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_delay() -> u64 {
    10
}

/// An artifact a job downloads into its workspace before the first step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInput {
    /// Producing job template.
    pub job: String,
    pub name: String,
    /// Destination relative to the workspace (defaults to the workspace root).
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

/// An artifact a job uploads after its last step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactOutput {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSpec {
    pub key: String,
    pub path: String,
    /// Workspace files whose contents are hashed into the key.
    #[serde(default)]
    pub hash_files: Vec<String>,
    #[serde(default = "default_true")]
    pub save: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub dimensions: MatrixAxes,
    #[serde(default)]
    pub include: Vec<MatrixAssignment>,
    #[serde(default)]
    pub exclude: Vec<MatrixAssignment>,
    /// Upper bound on concurrently running instances of this job.
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

impl MatrixConfig {
    pub fn axis(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        self.dimensions.0.push(MatrixAxis {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }
}

/// Matrix axes in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixAxes(pub Vec<MatrixAxis>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixAxes {
    pub fn iter(&self) -> impl Iterator<Item = &MatrixAxis> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for MatrixAxes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for axis in &self.0 {
            map.serialize_entry(&axis.name, &axis.values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixAxes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AxesVisitor;

        impl<'de> Visitor<'de> for AxesVisitor {
            type Value = MatrixAxes;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of axis names to lists of values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut axes = Vec::new();
                while let Some((name, raw)) = map.next_entry::<String, Vec<serde_json::Value>>()? {
                    let values = raw
                        .into_iter()
                        .map(scalar_to_string)
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(|e| de::Error::custom(format!("matrix axis '{}': {}", name, e)))?;
                    axes.push(MatrixAxis { name, values });
                }
                Ok(MatrixAxes(axes))
            }
        }

        deserializer.deserialize_map(AxesVisitor)
    }
}

/// Ordered axis → value pairs identifying one matrix combination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatrixAssignment(Vec<(String, String)>);

impl MatrixAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn push(&mut self, axis: impl Into<String>, value: impl Into<String>) {
        self.0.push((axis.into(), value.into()));
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when every pair of `subset` is present in `self`.
    pub fn contains(&self, subset: &MatrixAssignment) -> bool {
        subset.iter().all(|(axis, value)| self.get(axis) == Some(value))
    }

    /// True when both assignments agree on every axis they share.
    pub fn agrees_with(&self, other: &MatrixAssignment) -> bool {
        self.iter()
            .all(|(axis, value)| other.get(axis).is_none_or(|v| v == value))
    }

    pub fn to_variables(&self) -> HashMap<String, String> {
        self.0.iter().cloned().collect()
    }
}

impl fmt::Display for MatrixAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&parts.join(", "))
    }
}

impl Serialize for MatrixAssignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (axis, value) in &self.0 {
            map.serialize_entry(axis, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixAssignment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AssignmentVisitor;

        impl<'de> Visitor<'de> for AssignmentVisitor {
            type Value = MatrixAssignment;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of axis names to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut pairs = Vec::new();
                while let Some((axis, raw)) = map.next_entry::<String, serde_json::Value>()? {
                    let value = scalar_to_string(raw)
                        .map_err(|e| de::Error::custom(format!("matrix axis '{}': {}", axis, e)))?;
                    pairs.push((axis, value));
                }
                Ok(MatrixAssignment(pairs))
            }
        }

        deserializer.deserialize_map(AssignmentVisitor)
    }
}

fn scalar_to_string(value: serde_json::Value) -> std::result::Result<String, String> {
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Null => Err("null is not a valid matrix value".to_string()),
        other => Err(format!("expected a scalar value, got {}", other)),
    }
}
