//! Pipeline scheduler.
//!
//! Drives every instance of a frozen DAG through
//! `Pending → Ready → Running → {Succeeded, Failed, Skipped}`. Executors run
//! as tasks on a `JoinSet` bounded by a semaphore; the control loop only
//! wakes when a task finishes or the run is cancelled.

use crate::dag::{DagBuilder, DagError, PipelineDag};
use crate::queue::{QueueManager, QueuedJob};
use chrono::Utc;
use conduit_core::context::RunContext;
use conduit_core::events::{EventSink, NullEventSink, RunEvent};
use conduit_core::pipeline::{NeedsPolicy, PipelineDefinition};
use conduit_core::ports::{ArtifactStore, JobRequest, JobRunner};
use conduit_core::run::{
    FailureReason, JobInstance, JobKey, JobOutcome, JobState, RunReport, RunStatus, SkipReason,
};
use futures::FutureExt;
use petgraph::graph::NodeIndex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running instances.
    pub max_concurrency: usize,
    /// Per `resource_class` limits. Classes without an entry are unlimited.
    pub resource_limits: HashMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            resource_limits: HashMap::new(),
        }
    }
}

/// Runs pipelines against a `JobRunner`.
pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, config: SchedulerConfig) -> Self {
        Self {
            runner,
            artifacts: None,
            events: Arc::new(NullEventSink),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Store finalized once the run ends.
    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Resolve and run a pipeline for the context's trigger event.
    ///
    /// Definition errors are returned before any job is dispatched.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
    ) -> Result<RunReport, DagError> {
        let dag = DagBuilder::new().build(definition, &ctx.trigger)?;
        Ok(self.execute(definition, &dag, ctx, cancel).await)
    }

    /// Run an already resolved DAG to completion.
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
        dag: &PipelineDag,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
    ) -> RunReport {
        let started_at = Utc::now();
        info!(
            run_id = %ctx.run_id,
            pipeline = %dag.pipeline(),
            jobs = dag.len(),
            max_concurrency = self.config.max_concurrency,
            "Starting pipeline run"
        );
        self.events.emit(RunEvent::RunStarted {
            run_id: ctx.run_id,
            pipeline: dag.pipeline().to_string(),
            jobs: dag.len(),
        });

        let filtered: Vec<JobInstance> = dag
            .filtered()
            .iter()
            .map(|name| {
                let position = definition.position(name).unwrap_or(usize::MAX);
                let mut instance = JobInstance::new(JobKey::plain(name.clone()), position, 0);
                instance.mark_skipped(SkipReason::TriggerFiltered);
                debug!(job = %name, "Job filtered by trigger");
                self.events.emit(RunEvent::JobSkipped {
                    job: instance.key.clone(),
                    reason: SkipReason::TriggerFiltered,
                });
                instance
            })
            .collect();

        let mut state = RunState::new(dag, self.events.as_ref(), &self.config);
        for root in dag.roots() {
            state.make_ready(root);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut join_set: JoinSet<(NodeIndex, JobOutcome)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                info!(run_id = %ctx.run_id, running = join_set.len(), "Run cancelled");
                state.cancel_pending();
            }
            if !cancelled {
                self.dispatch(&mut state, &mut join_set, &semaphore, &ctx, &cancel);
            }
            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {}
                joined = join_set.join_next() => match joined {
                    Some(Ok((index, outcome))) => state.finish(index, outcome),
                    Some(Err(e)) => error!(error = %e, "Job task failed to join"),
                    None => break,
                },
            }
        }

        state.abandon_leftovers();

        if let Some(store) = &self.artifacts
            && let Err(e) = store.finalize_run().await
        {
            warn!(run_id = %ctx.run_id, error = %e, "Failed to finalize artifacts");
        }
        teardown(&ctx).await;

        let mut instances: Vec<JobInstance> = state.instances;
        instances.extend(filtered);
        instances.sort_by_key(|instance| (instance.template_index, instance.matrix_index));
        let jobs: Vec<_> = instances.iter().map(JobInstance::report).collect();

        let status = RunStatus::from_jobs(&jobs, cancelled);
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        info!(run_id = %ctx.run_id, %status, duration_ms, "Pipeline run finished");
        self.events.emit(RunEvent::RunCompleted {
            run_id: ctx.run_id,
            status,
        });

        RunReport {
            run_id: ctx.run_id,
            pipeline: dag.pipeline().to_string(),
            status,
            cancelled,
            started_at,
            finished_at,
            duration_ms,
            jobs,
        }
    }

    /// Move queued instances to Running while slots are free.
    fn dispatch(
        &self,
        state: &mut RunState<'_>,
        join_set: &mut JoinSet<(NodeIndex, JobOutcome)>,
        semaphore: &Arc<Semaphore>,
        ctx: &Arc<RunContext>,
        cancel: &CancellationToken,
    ) {
        loop {
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };
            let Some(job) = state.queue.dequeue() else {
                break;
            };

            let index = job.node;
            let node = state.dag.node(index);
            let request = JobRequest {
                key: node.key.clone(),
                template: Arc::clone(&node.template),
            };
            state.start(job, permit);

            let runner = Arc::clone(&self.runner);
            let ctx = Arc::clone(ctx);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let outcome = AssertUnwindSafe(runner.run(request, ctx, cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        JobOutcome::failed(FailureReason::Internal {
                            message: panic_message(panic.as_ref()),
                        })
                    });
                (index, outcome)
            });
        }
    }
}

/// Mutable bookkeeping for one run. Only the control loop touches it.
struct RunState<'a> {
    dag: &'a PipelineDag,
    events: &'a dyn EventSink,
    /// Indexed by `NodeIndex::index()`.
    instances: Vec<JobInstance>,
    /// Prerequisites not yet terminal, per instance.
    remaining: Vec<usize>,
    queue: QueueManager,
    /// The permit is released in `finish`, once the instance is terminal.
    running: HashMap<NodeIndex, (QueuedJob, OwnedSemaphorePermit)>,
}

impl<'a> RunState<'a> {
    fn new(dag: &'a PipelineDag, events: &'a dyn EventSink, config: &SchedulerConfig) -> Self {
        let mut queue = QueueManager::new();
        for (class, limit) in &config.resource_limits {
            queue.set_concurrency_limit(QueueManager::resource_group(class), *limit);
        }

        let mut instances = Vec::with_capacity(dag.len());
        let mut remaining = Vec::with_capacity(dag.len());
        for (index, node) in dag.nodes() {
            let mut instance = JobInstance::new(node.key.clone(), node.template_index, node.matrix_index);
            instance.prerequisites = dag
                .predecessors(index)
                .into_iter()
                .map(|p| dag.node(p).key.clone())
                .collect();
            remaining.push(instance.prerequisites.len());
            instances.push(instance);

            if let Some(max_parallel) = node.template.matrix.as_ref().and_then(|m| m.max_parallel) {
                queue.set_concurrency_limit(QueueManager::matrix_group(&node.key.template), max_parallel);
            }
        }

        Self {
            dag,
            events,
            instances,
            remaining,
            queue,
            running: HashMap::new(),
        }
    }

    fn instance(&self, index: NodeIndex) -> &JobInstance {
        &self.instances[index.index()]
    }

    fn make_ready(&mut self, index: NodeIndex) {
        let node = self.dag.node(index);
        let mut concurrency_groups = Vec::new();
        if let Some(class) = &node.template.resource_class {
            concurrency_groups.push(QueueManager::resource_group(class));
        }
        if node.template.matrix.as_ref().is_some_and(|m| m.max_parallel.is_some()) {
            concurrency_groups.push(QueueManager::matrix_group(&node.key.template));
        }

        self.instances[index.index()].state = JobState::Ready;
        debug!(job = %node.key, "Job ready");
        self.events.emit(RunEvent::JobReady {
            job: node.key.clone(),
        });
        self.queue.enqueue(QueuedJob {
            node: index,
            key: node.key.clone(),
            template_index: node.template_index,
            matrix_index: node.matrix_index,
            concurrency_groups,
        });
    }

    fn start(&mut self, job: QueuedJob, permit: OwnedSemaphorePermit) {
        let instance = &mut self.instances[job.node.index()];
        instance.mark_running();
        info!(job = %instance.key, "Dispatching job");
        self.events.emit(RunEvent::JobStarted {
            job: instance.key.clone(),
        });
        self.running.insert(job.node, (job, permit));
    }

    fn finish(&mut self, index: NodeIndex, outcome: JobOutcome) {
        if let Some((job, permit)) = self.running.remove(&index) {
            self.queue.complete(&job);
            drop(permit);
        }

        let instance = &mut self.instances[index.index()];
        instance.complete(outcome);
        let report = instance.report();
        match instance.state {
            JobState::Succeeded => info!(job = %instance.key, duration_ms = ?report.duration_ms, "Job succeeded"),
            _ => warn!(job = %instance.key, reason = ?report.reason(), "Job failed"),
        }
        self.events.emit(RunEvent::JobFinished {
            job: instance.key.clone(),
            state: instance.state,
            reason: report.reason(),
            duration_ms: report.duration_ms,
        });

        self.resolve_dependents(index);
    }

    /// Re-evaluate dependents of a newly terminal instance.
    ///
    /// Skips cascade through a worklist so a whole failed subtree resolves
    /// in one pass.
    fn resolve_dependents(&mut self, index: NodeIndex) {
        let mut terminal = vec![index];

        while let Some(done) = terminal.pop() {
            for dependent in self.dag.successors(done) {
                let slot = &mut self.remaining[dependent.index()];
                *slot = slot.saturating_sub(1);
                if self.instance(dependent).state != JobState::Pending {
                    continue;
                }

                match self.evaluate(dependent, done) {
                    Readiness::Wait => {}
                    Readiness::Ready => self.make_ready(dependent),
                    Readiness::Skip(origin) => {
                        self.skip(dependent, SkipReason::UpstreamFailed { origin });
                        terminal.push(dependent);
                    }
                }
            }
        }
    }

    fn evaluate(&self, dependent: NodeIndex, resolved: NodeIndex) -> Readiness {
        let policy = self.dag.node(dependent).template.needs_policy;

        if policy == NeedsPolicy::Success && self.instance(resolved).state != JobState::Succeeded {
            return Readiness::Skip(self.origin_of(resolved));
        }
        if self.remaining[dependent.index()] > 0 {
            return Readiness::Wait;
        }

        let prerequisites = self.dag.predecessors(dependent);
        match policy {
            NeedsPolicy::Success | NeedsPolicy::Always => Readiness::Ready,
            NeedsPolicy::PartialSuccess => {
                if prerequisites
                    .iter()
                    .any(|&p| self.instance(p).state == JobState::Succeeded)
                {
                    Readiness::Ready
                } else {
                    Readiness::Skip(self.origin_of(prerequisites.first().copied().unwrap_or(resolved)))
                }
            }
        }
    }

    /// The instance a failure chain started from.
    fn origin_of(&self, index: NodeIndex) -> String {
        let instance = self.instance(index);
        match &instance.skip {
            Some(SkipReason::UpstreamFailed { origin }) => origin.clone(),
            _ => instance.key.to_string(),
        }
    }

    fn skip(&mut self, index: NodeIndex, reason: SkipReason) {
        let instance = &mut self.instances[index.index()];
        info!(job = %instance.key, %reason, "Skipping job");
        self.events.emit(RunEvent::JobSkipped {
            job: instance.key.clone(),
            reason: reason.clone(),
        });
        instance.mark_skipped(reason);
    }

    /// Skip everything that has not started yet.
    fn cancel_pending(&mut self) {
        self.queue.drain();
        let waiting: Vec<NodeIndex> = self
            .dag
            .nodes()
            .map(|(index, _)| index)
            .filter(|&index| matches!(self.instance(index).state, JobState::Pending | JobState::Ready))
            .collect();
        for index in waiting {
            self.skip(index, SkipReason::Cancelled);
        }
    }

    /// Settle instances left non-terminal by a task that could not be joined.
    fn abandon_leftovers(&mut self) {
        let leftovers: Vec<NodeIndex> = self
            .dag
            .nodes()
            .map(|(index, _)| index)
            .filter(|&index| !self.instance(index).state.is_terminal())
            .collect();
        for index in leftovers {
            if self.instance(index).state == JobState::Running {
                self.finish(
                    index,
                    JobOutcome::failed(FailureReason::Internal {
                        message: "job task was lost".to_string(),
                    }),
                );
            } else if !self.instance(index).state.is_terminal() {
                self.skip(index, SkipReason::Cancelled);
            }
        }
    }
}

enum Readiness {
    Wait,
    Ready,
    Skip(String),
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("job panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("job panicked: {}", message)
    } else {
        "job panicked".to_string()
    }
}

/// Remove the run's workspace exactly once.
async fn teardown(ctx: &RunContext) {
    if !ctx.teardown() || ctx.keep_workspaces {
        return;
    }
    let workspace = ctx.run_workspace();
    if workspace.exists()
        && let Err(e) = tokio::fs::remove_dir_all(&workspace).await
    {
        warn!(path = %workspace.display(), error = %e, "Failed to remove run workspace");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_core::pipeline::{JobTemplate, StepDefinition};
    use std::sync::Mutex;

    /// Fails the named templates, records dispatch order.
    #[derive(Default)]
    struct ScriptedRunner {
        fail: Vec<&'static str>,
        panic: Vec<&'static str>,
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run(&self, request: JobRequest, _ctx: Arc<RunContext>, _cancel: CancellationToken) -> JobOutcome {
            self.started.lock().unwrap().push(request.key.to_string());
            let name = request.key.template.as_str();
            if self.panic.iter().any(|n| *n == name) {
                panic!("boom");
            }
            if self.fail.iter().any(|n| *n == name) {
                JobOutcome::failed(FailureReason::StepFailed {
                    step: "run".to_string(),
                    exit_code: 1,
                })
            } else {
                JobOutcome::succeeded()
            }
        }
    }

    fn pipeline(jobs: Vec<JobTemplate>) -> PipelineDefinition {
        PipelineDefinition {
            version: "1".to_string(),
            name: "unit".to_string(),
            description: None,
            variables: Default::default(),
            jobs,
            artifacts: Default::default(),
        }
    }

    fn job(name: &str, needs: &[&str]) -> JobTemplate {
        JobTemplate::new(name)
            .needs(needs.iter().copied())
            .step(StepDefinition::new("run", "true"))
    }

    async fn run(runner: Arc<ScriptedRunner>, definition: &PipelineDefinition) -> RunReport {
        let root = tempfile::tempdir().unwrap();
        let ctx = Arc::new(RunContext::builder(definition).workspace_root(root.path()).build());
        Scheduler::new(runner, SchedulerConfig::default())
            .run(definition, ctx, CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_skip_attributes_original_failure() {
        let runner = Arc::new(ScriptedRunner {
            fail: vec!["build"],
            ..Default::default()
        });
        let definition = pipeline(vec![
            job("build", &[]),
            job("test", &["build"]),
            job("release", &["test"]),
        ]);

        let report = run(runner.clone(), &definition).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.job("build").unwrap().state, JobState::Failed);
        for name in ["test", "release"] {
            let job = report.job(name).unwrap();
            assert_eq!(job.state, JobState::Skipped);
            assert_eq!(
                job.skip,
                Some(SkipReason::UpstreamFailed {
                    origin: "build".to_string()
                })
            );
        }
        assert_eq!(*runner.started.lock().unwrap(), vec!["build".to_string()]);
    }

    #[tokio::test]
    async fn test_needs_policies() {
        let runner = Arc::new(ScriptedRunner {
            fail: vec!["flaky"],
            ..Default::default()
        });
        let mut partial = job("partial", &["stable", "flaky"]);
        partial.needs_policy = NeedsPolicy::PartialSuccess;
        let mut always = job("cleanup", &["flaky"]);
        always.needs_policy = NeedsPolicy::Always;
        let definition = pipeline(vec![
            job("stable", &[]),
            job("flaky", &[]),
            partial,
            always,
            job("strict", &["stable", "flaky"]),
        ]);

        let report = run(runner, &definition).await;

        assert_eq!(report.job("partial").unwrap().state, JobState::Succeeded);
        assert_eq!(report.job("cleanup").unwrap().state, JobState::Succeeded);
        assert_eq!(report.job("strict").unwrap().state, JobState::Skipped);
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_panicking_job_becomes_failed() {
        let runner = Arc::new(ScriptedRunner {
            panic: vec!["build"],
            ..Default::default()
        });
        let definition = pipeline(vec![job("build", &[]), job("lint", &[])]);

        let report = run(runner, &definition).await;

        let build = report.job("build").unwrap();
        assert_eq!(build.state, JobState::Failed);
        assert!(matches!(build.failure, Some(FailureReason::Internal { .. })));
        assert_eq!(report.job("lint").unwrap().state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_all_filtered_is_neutral() {
        use conduit_core::pipeline::{TriggerConfig, TriggerType};

        let runner = Arc::new(ScriptedRunner::default());
        let mut deploy = job("deploy", &[]);
        deploy.triggers = vec![TriggerConfig {
            events: vec![TriggerType::Tag],
            ..Default::default()
        }];
        let definition = pipeline(vec![deploy]);

        let report = run(runner.clone(), &definition).await;

        assert_eq!(report.status, RunStatus::Neutral);
        assert_eq!(report.job("deploy").unwrap().skip, Some(SkipReason::TriggerFiltered));
        assert!(runner.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_workspace_removed_once() {
        let runner = Arc::new(ScriptedRunner::default());
        let definition = pipeline(vec![job("build", &[])]);
        let root = tempfile::tempdir().unwrap();
        let ctx = Arc::new(RunContext::builder(&definition).workspace_root(root.path()).build());
        std::fs::create_dir_all(ctx.run_workspace()).unwrap();

        Scheduler::new(runner, SchedulerConfig::default())
            .run(&definition, Arc::clone(&ctx), CancellationToken::new())
            .await
            .unwrap();

        assert!(ctx.is_torn_down());
        assert!(!ctx.run_workspace().exists());
        assert!(!ctx.teardown());
    }
}
