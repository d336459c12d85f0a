//! Job instance, outcome and report types.

use crate::ids::RunId;
use crate::pipeline::MatrixAssignment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Identity of a job instance: template name plus matrix combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub template: String,
    #[serde(default, skip_serializing_if = "MatrixAssignment::is_empty")]
    pub matrix: MatrixAssignment,
}

impl JobKey {
    pub fn new(template: impl Into<String>, matrix: MatrixAssignment) -> Self {
        Self {
            template: template.into(),
            matrix,
        }
    }

    pub fn plain(template: impl Into<String>) -> Self {
        Self::new(template, MatrixAssignment::new())
    }

    /// Filesystem-safe form, e.g. `build-os-ubuntu`.
    pub fn slug(&self) -> String {
        let mut raw = self.template.clone();
        for (axis, value) in self.matrix.iter() {
            raw.push('-');
            raw.push_str(axis);
            raw.push('-');
            raw.push_str(value);
        }
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.matrix.is_empty() {
            write!(f, "{}", self.template)
        } else {
            write!(f, "{} ({})", self.template, self.matrix)
        }
    }
}

/// Identifies an artifact within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub job: String,
    pub name: String,
}

impl ArtifactRef {
    pub fn new(job: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job, self.name)
    }
}

/// Metadata returned by a successful artifact put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub reference: ArtifactRef,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Workspace, input artifact or other pre-step failure.
    Setup { message: String },
    StepFailed { step: String, exit_code: i32 },
    TimedOut { after_secs: u64 },
    Cancelled,
    OutputMissing { name: String, path: String },
    Internal { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Setup { message } => write!(f, "setup failed: {}", message),
            FailureReason::StepFailed { step, exit_code } => {
                write!(f, "step '{}' exited with code {}", step, exit_code)
            }
            FailureReason::TimedOut { after_secs } => write!(f, "timed out after {}s", after_secs),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::OutputMissing { name, path } => {
                write!(f, "output '{}' missing at {}", name, path)
            }
            FailureReason::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A prerequisite chain failed; `origin` is the instance that failed.
    UpstreamFailed { origin: String },
    Cancelled,
    TriggerFiltered,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UpstreamFailed { origin } => write!(f, "upstream failed: {}", origin),
            SkipReason::Cancelled => f.write_str("cancelled"),
            SkipReason::TriggerFiltered => f.write_str("filtered by trigger"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub duration_ms: u64,
    /// The step failed but was allowed to continue.
    #[serde(default)]
    pub allowed_failure: bool,
}

/// What a job executor hands back to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub failure: Option<FailureReason>,
    pub exit_code: Option<i32>,
    pub steps: Vec<StepReport>,
    pub produced: Vec<ArtifactHandle>,
    pub consumed: Vec<ArtifactRef>,
}

impl JobOutcome {
    pub fn succeeded() -> Self {
        Self::default()
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            failure: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// One materialized (template × matrix combination) node of a run.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub key: JobKey,
    /// Index of the template in the pipeline definition.
    pub template_index: usize,
    /// Index of the combination in the template's expansion.
    pub matrix_index: usize,
    pub prerequisites: Vec<JobKey>,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub skip: Option<SkipReason>,
    pub steps: Vec<StepReport>,
    pub produced: Vec<ArtifactHandle>,
    pub consumed: Vec<ArtifactRef>,
}

impl JobInstance {
    pub fn new(key: JobKey, template_index: usize, matrix_index: usize) -> Self {
        Self {
            key,
            template_index,
            matrix_index,
            prerequisites: Vec::new(),
            state: JobState::Pending,
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure: None,
            skip: None,
            steps: Vec::new(),
            produced: Vec::new(),
            consumed: Vec::new(),
        }
    }

    pub fn mark_running(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, outcome: JobOutcome) {
        self.state = if outcome.is_success() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        self.finished_at = Some(Utc::now());
        self.exit_code = outcome.exit_code;
        self.failure = outcome.failure;
        self.steps = outcome.steps;
        self.produced = outcome.produced;
        self.consumed = outcome.consumed;
    }

    pub fn mark_skipped(&mut self, reason: SkipReason) {
        self.state = JobState::Skipped;
        self.skip = Some(reason);
    }

    pub fn report(&self) -> JobReport {
        let duration_ms = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        };
        JobReport {
            name: self.key.template.clone(),
            matrix: self.key.matrix.clone(),
            state: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms,
            exit_code: self.exit_code,
            failure: self.failure.clone(),
            skip: self.skip.clone(),
            steps: self.steps.clone(),
            artifacts: self.produced.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub name: String,
    #[serde(default, skip_serializing_if = "MatrixAssignment::is_empty")]
    pub matrix: MatrixAssignment,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactHandle>,
}

impl JobReport {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.name.clone(), self.matrix.clone())
    }

    /// Human-readable failure or skip reason.
    pub fn reason(&self) -> Option<String> {
        self.failure
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.skip.as_ref().map(ToString::to_string))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Nothing ran: every job was filtered out or none were selected.
    Neutral,
}

impl RunStatus {
    /// Derive the whole-run result from the final job states.
    pub fn from_jobs(jobs: &[JobReport], cancelled: bool) -> Self {
        if cancelled {
            return RunStatus::Failed;
        }
        if jobs.iter().all(|job| job.state == JobState::Skipped) {
            return RunStatus::Neutral;
        }
        let upstream_skipped = jobs
            .iter()
            .any(|job| matches!(job.skip, Some(SkipReason::UpstreamFailed { .. })));
        let all_passed = jobs
            .iter()
            .filter(|job| job.state != JobState::Skipped)
            .all(|job| job.state == JobState::Succeeded);
        if all_passed && !upstream_skipped {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Neutral => "neutral",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: RunStatus,
    #[serde(default)]
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    /// First report for a template name (the only one for non-matrix jobs).
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn instances<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a JobReport> + 'a {
        self.jobs.iter().filter(move |job| job.name == name)
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|job| job.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, state: JobState, skip: Option<SkipReason>) -> JobReport {
        JobReport {
            name: name.to_string(),
            matrix: MatrixAssignment::new(),
            state,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            exit_code: None,
            failure: None,
            skip,
            steps: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn test_job_key_display_and_slug() {
        let key = JobKey::new("build", MatrixAssignment::from_pairs([("os", "ubuntu")]));
        assert_eq!(key.to_string(), "build (os=ubuntu)");
        assert_eq!(key.slug(), "build-os-ubuntu");
        assert_eq!(JobKey::plain("release").to_string(), "release");

        let odd = JobKey::new("pkg", MatrixAssignment::from_pairs([("target", "x86_64/linux gnu")]));
        assert_eq!(odd.slug(), "pkg-target-x86_64_linux_gnu");
    }

    #[test]
    fn test_run_status_succeeded_with_filtered_jobs() {
        let jobs = vec![
            report("build", JobState::Succeeded, None),
            report("deploy", JobState::Skipped, Some(SkipReason::TriggerFiltered)),
        ];
        assert_eq!(RunStatus::from_jobs(&jobs, false), RunStatus::Succeeded);
    }

    #[test]
    fn test_run_status_failed_on_upstream_skip() {
        let jobs = vec![
            report("build", JobState::Failed, None),
            report(
                "test",
                JobState::Skipped,
                Some(SkipReason::UpstreamFailed {
                    origin: "build".to_string(),
                }),
            ),
        ];
        assert_eq!(RunStatus::from_jobs(&jobs, false), RunStatus::Failed);
    }

    #[test]
    fn test_run_status_neutral_and_cancelled() {
        let filtered = vec![report("deploy", JobState::Skipped, Some(SkipReason::TriggerFiltered))];
        assert_eq!(RunStatus::from_jobs(&filtered, false), RunStatus::Neutral);
        assert_eq!(RunStatus::from_jobs(&[], false), RunStatus::Neutral);

        let cancelled = vec![report("build", JobState::Skipped, Some(SkipReason::Cancelled))];
        assert_eq!(RunStatus::from_jobs(&cancelled, true), RunStatus::Failed);
    }

    #[test]
    fn test_instance_lifecycle() {
        let mut instance = JobInstance::new(JobKey::plain("build"), 0, 0);
        assert_eq!(instance.state, JobState::Pending);

        instance.mark_running();
        instance.complete(JobOutcome::failed(FailureReason::StepFailed {
            step: "compile".to_string(),
            exit_code: 2,
        }));

        let report = instance.report();
        assert_eq!(report.state, JobState::Failed);
        assert!(report.duration_ms.is_some());
        assert_eq!(report.reason().unwrap(), "step 'compile' exited with code 2");
    }
}
