//! Job execution logic.

use crate::environments::{Environment, HostEnvironment};
use crate::runner::{OutputLine, StepContext, StepResult, StepRunner, StepTermination};
use crate::shell::ShellRunner;
use async_trait::async_trait;
use conduit_cache::{ArtifactTransport, CacheTransport, cache_key};
use conduit_core::context::RunContext;
use conduit_core::events::{EventSink, NullEventSink, RunEvent};
use conduit_core::interpolation::InterpolationContext;
use conduit_core::pipeline::{JobTemplate, StepDefinition, is_workspace_relative};
use conduit_core::ports::{ArtifactStore, CacheStore, JobRequest, JobRunner};
use conduit_core::run::{ArtifactRef, FailureReason, JobKey, JobOutcome, StepReport, StepStatus};
use conduit_core::Error;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OUTPUT_BUFFER: usize = 256;

/// Runs one job instance from workspace setup to cleanup.
pub struct JobExecutor {
    artifacts: ArtifactTransport,
    cache: CacheTransport,
    runner: Arc<dyn StepRunner>,
    events: Arc<dyn EventSink>,
}

/// Per-job values shared by every step.
struct JobScope<'a> {
    key: &'a JobKey,
    template: &'a JobTemplate,
    ctx: &'a RunContext,
    workspace: &'a Path,
    interpolation: InterpolationContext,
    env: HashMap<String, String>,
}

impl JobExecutor {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            artifacts: ArtifactTransport::new(artifacts),
            cache: CacheTransport::new(cache),
            runner: Arc::new(ShellRunner::new()),
            events: Arc::new(NullEventSink),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_artifact_transport(mut self, artifacts: ArtifactTransport) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Execute a job instance. Every failure is reported in the outcome.
    pub async fn execute(
        &self,
        request: &JobRequest,
        ctx: &RunContext,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let key = &request.key;
        info!(run_id = %ctx.run_id, job = %key, "Starting job execution");

        let environment = HostEnvironment::for_job(ctx, key);
        if let Err(e) = environment.prepare().await {
            error!(job = %key, error = %e, "Workspace setup failed");
            return JobOutcome::failed(FailureReason::Setup {
                message: e.to_string(),
            });
        }

        let scope = JobScope::new(key, &request.template, ctx, environment.working_dir());
        let mut outcome = JobOutcome::default();
        if let Err(reason) = self.run_job(&scope, cancel, &mut outcome).await {
            warn!(job = %key, reason = %reason, "Job failed");
            outcome.failure = Some(reason);
        } else {
            info!(job = %key, "Job succeeded");
        }

        if ctx.keep_workspaces {
            debug!(job = %key, workspace = %environment.working_dir().display(), "Keeping workspace");
        } else {
            environment.cleanup().await;
        }
        outcome
    }

    async fn run_job(
        &self,
        scope: &JobScope<'_>,
        cancel: CancellationToken,
        outcome: &mut JobOutcome,
    ) -> Result<(), FailureReason> {
        if cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }

        // The job timeout covers input fetch, cache restore and the steps. It
        // cancels a child token so the running step still gets its grace period.
        let job_cancel = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = scope.template.timeout_seconds.map(|secs| {
            let token = job_cancel.clone();
            let flag = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                flag.store(true, Ordering::Release);
                token.cancel();
            })
        });

        let ran = self.prepare_and_run(scope, &job_cancel, outcome).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        let cache_keys = ran.map_err(|reason| match reason {
            FailureReason::Cancelled if timed_out.load(Ordering::Acquire) => FailureReason::TimedOut {
                after_secs: scope.template.timeout_seconds.unwrap_or_default(),
            },
            other => other,
        })?;

        self.upload_outputs(scope, outcome).await?;
        self.save_caches(scope, &cache_keys).await;
        Ok(())
    }

    /// Inputs, caches, then steps. Returns the resolved cache keys.
    async fn prepare_and_run(
        &self,
        scope: &JobScope<'_>,
        cancel: &CancellationToken,
        outcome: &mut JobOutcome,
    ) -> Result<Vec<String>, FailureReason> {
        let prepared = tokio::select! {
            prepared = async {
                self.fetch_inputs(scope, outcome).await?;
                Ok::<_, FailureReason>(self.restore_caches(scope).await)
            } => prepared,
            _ = cancel.cancelled() => Err(FailureReason::Cancelled),
        };
        let cache_keys = prepared?;
        self.run_steps(scope, cancel, outcome).await?;
        Ok(cache_keys)
    }

    async fn fetch_inputs(
        &self,
        scope: &JobScope<'_>,
        outcome: &mut JobOutcome,
    ) -> Result<(), FailureReason> {
        for input in &scope.template.inputs {
            let name = scope.interpolation.interpolate(&input.name);
            let dest = match &input.path {
                Some(path) => scope.workspace.join(inside_workspace(scope.interpolation.interpolate(path))?),
                None => scope.workspace.to_path_buf(),
            };

            match self.artifacts.download(&input.job, &name, &dest).await {
                Ok(size) => {
                    info!(job = %scope.key, artifact = %format!("{}/{}", input.job, name), size, "Fetched input artifact");
                    outcome.consumed.push(ArtifactRef::new(input.job.clone(), name));
                }
                Err(e) if e.is_not_found() && !input.required => {
                    warn!(job = %scope.key, artifact = %format!("{}/{}", input.job, name), "Optional input artifact not found");
                }
                Err(e) => {
                    return Err(FailureReason::Setup {
                        message: format!("input {}/{}: {}", input.job, name, e),
                    });
                }
            }
        }
        Ok(())
    }

    /// Restore declared caches and return the keys they resolved to.
    async fn restore_caches(&self, scope: &JobScope<'_>) -> Vec<String> {
        let mut keys = Vec::with_capacity(scope.template.caches.len());
        for spec in &scope.template.caches {
            let template = scope.interpolation.interpolate(&spec.key);
            let key = cache_key(&template, scope.workspace, &spec.hash_files);
            match self.cache.restore(&key, scope.workspace).await {
                Ok(true) => info!(job = %scope.key, key = %key, "Cache hit"),
                Ok(false) => info!(job = %scope.key, key = %key, "Cache miss"),
                Err(e) => warn!(job = %scope.key, key = %key, error = %e, "Cache restore failed"),
            }
            keys.push(key);
        }
        keys
    }

    async fn run_steps(
        &self,
        scope: &JobScope<'_>,
        cancel: &CancellationToken,
        outcome: &mut JobOutcome,
    ) -> Result<(), FailureReason> {
        let total = scope.template.steps.len();
        for (idx, step) in scope.template.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(FailureReason::Cancelled);
            }
            info!(job = %scope.key, step = %step.name, index = idx + 1, total, "Executing step");

            let step_ctx = scope.step_context(step)?;
            let (result, attempts) = match self.run_with_retries(scope, step, &step_ctx, cancel).await {
                Ok(done) => done,
                Err(e) => {
                    error!(job = %scope.key, step = %step.name, error = %e, "Step could not start");
                    outcome.steps.push(StepReport {
                        name: step.name.clone(),
                        status: StepStatus::Failed,
                        exit_code: None,
                        attempts: 1,
                        duration_ms: 0,
                        allowed_failure: !step.is_fatal(),
                    });
                    if step.is_fatal() {
                        return Err(FailureReason::Setup {
                            message: format!("step '{}': {}", step.name, e),
                        });
                    }
                    continue;
                }
            };

            let status = match result.termination {
                StepTermination::Exited(0) => StepStatus::Succeeded,
                StepTermination::Exited(_) => StepStatus::Failed,
                StepTermination::TimedOut => StepStatus::TimedOut,
                StepTermination::Cancelled => StepStatus::Cancelled,
            };
            let failed = status != StepStatus::Succeeded;
            outcome.steps.push(StepReport {
                name: step.name.clone(),
                status,
                exit_code: result.exit_code(),
                attempts,
                duration_ms: result.duration_ms,
                allowed_failure: failed && !step.is_fatal(),
            });
            if let Some(code) = result.exit_code() {
                outcome.exit_code = Some(code);
            }

            match result.termination {
                StepTermination::Exited(0) => {
                    info!(job = %scope.key, step = %step.name, duration_ms = result.duration_ms, "Step completed successfully");
                }
                StepTermination::Cancelled => return Err(FailureReason::Cancelled),
                StepTermination::Exited(code) if step.is_fatal() => {
                    return Err(FailureReason::StepFailed {
                        step: step.name.clone(),
                        exit_code: code,
                    });
                }
                StepTermination::TimedOut if step.is_fatal() => {
                    return Err(FailureReason::TimedOut {
                        after_secs: step_ctx.timeout.as_secs(),
                    });
                }
                _ => {
                    warn!(job = %scope.key, step = %step.name, "Step failed, continuing");
                }
            }
        }
        Ok(())
    }

    async fn run_with_retries(
        &self,
        scope: &JobScope<'_>,
        step: &StepDefinition,
        step_ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> conduit_core::Result<(StepResult, u32)> {
        let max_attempts = step.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1).max(1);
        let delay = Duration::from_secs(step.retry.as_ref().map(|r| r.delay_seconds).unwrap_or(0));

        let mut attempt = 1;
        loop {
            let result = self.run_attempt(scope, step_ctx, cancel).await?;
            let retryable = matches!(
                result.termination,
                StepTermination::Exited(code) if code != 0
            ) || result.termination == StepTermination::TimedOut;

            if !retryable || attempt >= max_attempts {
                return Ok((result, attempt));
            }

            warn!(job = %scope.key, step = %step.name, attempt, max_attempts, "Step failed, will retry");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    let cancelled = StepResult {
                        termination: StepTermination::Cancelled,
                        duration_ms: result.duration_ms,
                    };
                    return Ok((cancelled, attempt));
                }
            }
            attempt += 1;
        }
    }

    async fn run_attempt(
        &self,
        scope: &JobScope<'_>,
        step_ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> conduit_core::Result<StepResult> {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let (result, ()) = tokio::join!(
            self.runner.execute(step_ctx, tx, cancel.clone()),
            self.forward_output(scope, &step_ctx.step, rx),
        );
        result
    }

    async fn forward_output(&self, scope: &JobScope<'_>, step: &str, mut rx: mpsc::Receiver<OutputLine>) {
        while let Some(line) = rx.recv().await {
            let content = scope.ctx.mask(&line.content);
            debug!(job = %scope.key, step, line = line.line_number, "{}", content);
            self.events.emit(RunEvent::StepOutput {
                job: scope.key.clone(),
                step: step.to_string(),
                stream: line.stream,
                line: content,
            });
        }
    }

    async fn upload_outputs(
        &self,
        scope: &JobScope<'_>,
        outcome: &mut JobOutcome,
    ) -> Result<(), FailureReason> {
        for output in &scope.template.outputs {
            let name = scope.interpolation.interpolate(&output.name);
            let path = inside_workspace(scope.interpolation.interpolate(&output.path))?;

            match self
                .artifacts
                .upload(&scope.key.template, &name, scope.workspace, &path)
                .await
            {
                Ok(handle) => {
                    info!(job = %scope.key, artifact = %handle.reference, size = handle.size_bytes, "Uploaded output artifact");
                    outcome.produced.push(handle);
                }
                Err(Error::ArtifactPathMissing(_)) => {
                    return Err(FailureReason::OutputMissing { name, path });
                }
                Err(e) => {
                    return Err(FailureReason::Internal {
                        message: format!("output {}: {}", name, e),
                    });
                }
            }
        }
        Ok(())
    }

    async fn save_caches(&self, scope: &JobScope<'_>, keys: &[String]) {
        for (spec, key) in scope.template.caches.iter().zip(keys) {
            if !spec.save {
                continue;
            }
            let path = scope.interpolation.interpolate(&spec.path);
            if !is_workspace_relative(&path) {
                warn!(job = %scope.key, key = %key, path = %path, "Cache path is outside the workspace, not saving");
                continue;
            }
            match self.cache.save(key, scope.workspace, &path).await {
                Ok(()) => info!(job = %scope.key, key = %key, "Cache saved"),
                Err(e) => warn!(job = %scope.key, key = %key, error = %e, "Cache save failed"),
            }
        }
    }
}

impl<'a> JobScope<'a> {
    fn new(key: &'a JobKey, template: &'a JobTemplate, ctx: &'a RunContext, workspace: &'a Path) -> Self {
        let matrix = key.matrix.to_variables();
        let base = InterpolationContext::new()
            .with_variables(ctx.variables.clone())
            .with_matrix(matrix.clone())
            .with_secrets(ctx.secrets.clone());

        let job_vars: HashMap<String, String> = template
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), base.interpolate(v)))
            .collect();

        // global < job < matrix; step variables are layered on per step.
        let mut env = ctx.base_env();
        env.extend(job_vars.clone());
        env.extend(matrix);
        env.insert("CONDUIT_WORKSPACE".to_string(), workspace.display().to_string());
        env.insert("CONDUIT_JOB".to_string(), key.to_string());
        env.insert("CONDUIT_JOB_NAME".to_string(), key.template.clone());

        Self {
            key,
            template,
            ctx,
            workspace,
            interpolation: base.with_variables(job_vars),
            env,
        }
    }

    fn step_context(&self, step: &StepDefinition) -> Result<StepContext, FailureReason> {
        let step_vars: HashMap<String, String> = step
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), self.interpolation.interpolate(v)))
            .collect();

        let mut env = self.env.clone();
        env.extend(step_vars.clone());
        let interpolation = self.interpolation.clone().with_variables(step_vars);

        let working_dir = match &step.working_directory {
            Some(dir) => self.workspace.join(inside_workspace(interpolation.interpolate(dir))?),
            None => self.workspace.to_path_buf(),
        };

        Ok(StepContext {
            job: self.key.to_string(),
            step: step.name.clone(),
            command: interpolation.interpolate(&step.run),
            shell: step.shell.clone(),
            working_dir,
            env,
            timeout: step
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.ctx.default_step_timeout),
            grace_period: self.ctx.grace_period,
        })
    }
}

/// Interpolated paths can still climb out of the workspace.
fn inside_workspace(path: String) -> Result<String, FailureReason> {
    if is_workspace_relative(&path) {
        Ok(path)
    } else {
        Err(FailureReason::Setup {
            message: format!("path '{}' is outside the workspace", path),
        })
    }
}

#[async_trait]
impl JobRunner for JobExecutor {
    async fn run(
        &self,
        request: JobRequest,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
    ) -> JobOutcome {
        self.execute(&request, &ctx, cancel).await
    }
}
