use conduit_cache::{MemoryArtifactStore, MemoryCacheStore};
use conduit_core::context::RunContext;
use conduit_core::events::{ChannelEventSink, RunEvent};
use conduit_core::pipeline::{
    ArtifactInput, ArtifactOutput, CacheSpec, JobTemplate, MatrixAssignment, PipelineDefinition,
    RetryConfig, StepDefinition,
};
use conduit_core::ports::{ArtifactStore, CacheStore, JobRequest};
use conduit_core::run::{FailureReason, JobKey, StepStatus};
use conduit_runner::JobExecutor;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    _root: TempDir,
    ctx: RunContext,
    artifacts: Arc<MemoryArtifactStore>,
    cache: Arc<MemoryCacheStore>,
}

impl Harness {
    fn new() -> Self {
        Self::with(|b| b)
    }

    fn with(
        configure: impl FnOnce(conduit_core::context::RunContextBuilder) -> conduit_core::context::RunContextBuilder,
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let definition =
            PipelineDefinition::from_yaml("name: demo\nvariables:\n  LEVEL: global\njobs: []\n").unwrap();
        let builder = RunContext::builder(&definition)
            .workspace_root(root.path())
            .grace_period(Duration::from_millis(500));
        Self {
            ctx: configure(builder).build(),
            _root: root,
            artifacts: Arc::new(MemoryArtifactStore::new()),
            cache: Arc::new(MemoryCacheStore::new()),
        }
    }

    fn executor(&self) -> JobExecutor {
        JobExecutor::new(self.artifacts.clone(), self.cache.clone())
    }

    async fn run(&self, template: JobTemplate) -> conduit_core::run::JobOutcome {
        self.run_keyed(template, MatrixAssignment::new()).await
    }

    async fn run_keyed(
        &self,
        template: JobTemplate,
        matrix: MatrixAssignment,
    ) -> conduit_core::run::JobOutcome {
        let request = JobRequest {
            key: JobKey::new(template.name.clone(), matrix),
            template: Arc::new(template),
        };
        self.executor()
            .execute(&request, &self.ctx, CancellationToken::new())
            .await
    }
}

fn output_lines(rx: &mut tokio::sync::mpsc::UnboundedReceiver<RunEvent>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::StepOutput { line, .. } = event {
            lines.push(line);
        }
    }
    lines
}

#[tokio::test]
async fn test_outputs_flow_to_consumer() {
    let harness = Harness::new();

    let mut build = JobTemplate::new("build")
        .step(StepDefinition::new("compile", "mkdir -p bin && printf 'core-${{ matrix.os }}' > bin/core"));
    build.outputs.push(ArtifactOutput {
        name: "core-${{ matrix.os }}".to_string(),
        path: "bin/core".to_string(),
    });
    let outcome = harness
        .run_keyed(build, MatrixAssignment::from_pairs([("os", "ubuntu")]))
        .await;
    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(outcome.produced.len(), 1);
    assert_eq!(outcome.produced[0].reference.name, "core-ubuntu");

    let mut test = JobTemplate::new("test").step(StepDefinition::new(
        "check",
        "test \"$(cat bin/core)\" = core-ubuntu",
    ));
    test.inputs.push(ArtifactInput {
        job: "build".to_string(),
        name: "core-ubuntu".to_string(),
        path: None,
        required: true,
    });
    let outcome = harness.run(test).await;
    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(outcome.consumed.len(), 1);
}

#[tokio::test]
async fn test_missing_input_fails_before_any_step() {
    let harness = Harness::new();
    let mut test = JobTemplate::new("test").step(StepDefinition::new("check", "true"));
    test.inputs.push(ArtifactInput {
        job: "build".to_string(),
        name: "core".to_string(),
        path: None,
        required: true,
    });
    test.outputs.push(ArtifactOutput {
        name: "report".to_string(),
        path: ".".to_string(),
    });

    let outcome = harness.run(test).await;
    assert!(matches!(outcome.failure, Some(FailureReason::Setup { .. })));
    assert!(outcome.steps.is_empty());
    assert!(harness.artifacts.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_optional_input_may_be_absent() {
    let harness = Harness::new();
    let mut test = JobTemplate::new("test").step(StepDefinition::new("check", "true"));
    test.inputs.push(ArtifactInput {
        job: "build".to_string(),
        name: "coverage".to_string(),
        path: None,
        required: false,
    });

    assert!(harness.run(test).await.is_success());
}

#[tokio::test]
async fn test_fatal_step_stops_job() {
    let harness = Harness::new();
    let mut job = JobTemplate::new("build")
        .step(StepDefinition::new("compile", "exit 4"))
        .step(StepDefinition::new("package", "true"));
    job.outputs.push(ArtifactOutput {
        name: "core".to_string(),
        path: ".".to_string(),
    });

    let outcome = harness.run(job).await;
    assert_eq!(
        outcome.failure,
        Some(FailureReason::StepFailed {
            step: "compile".to_string(),
            exit_code: 4,
        })
    );
    assert_eq!(outcome.exit_code, Some(4));
    assert_eq!(outcome.steps.len(), 1);
    assert!(outcome.produced.is_empty());
    assert!(harness.artifacts.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_continue_on_error_keeps_going() {
    let harness = Harness::new();
    let mut lint = StepDefinition::new("lint", "exit 1");
    lint.continue_on_error = true;
    let job = JobTemplate::new("build")
        .step(lint)
        .step(StepDefinition::new("compile", "true"));

    let outcome = harness.run(job).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.steps[0].allowed_failure);
    assert_eq!(outcome.steps[1].status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_environment_layering_and_masking() {
    let harness = Harness::with(|b| {
        b.secrets(HashMap::from([("API_TOKEN".to_string(), "tok-9f8e".to_string())]))
    });
    let (sink, mut rx) = ChannelEventSink::channel();

    let mut job = JobTemplate::new("build");
    job.variables.insert("LEVEL".to_string(), "job".to_string());
    job.variables.insert("TARGET".to_string(), "${{ matrix.os }}-x64".to_string());
    let mut step = StepDefinition::new(
        "show",
        "echo \"$LEVEL $TARGET $os\"; echo \"job=$CONDUIT_JOB\"; echo \"token=$API_TOKEN\"; test -d \"$CONDUIT_WORKSPACE\"",
    );
    step.variables.insert("EXTRA".to_string(), "1".to_string());
    let mut override_step = StepDefinition::new("override", "echo \"$LEVEL\"");
    override_step.variables.insert("LEVEL".to_string(), "step".to_string());
    let job = job.step(step).step(override_step);

    let request = JobRequest {
        key: JobKey::new("build", MatrixAssignment::from_pairs([("os", "linux")])),
        template: Arc::new(job),
    };
    let outcome = harness
        .executor()
        .with_events(Arc::new(sink))
        .execute(&request, &harness.ctx, CancellationToken::new())
        .await;
    assert!(outcome.is_success(), "{:?}", outcome.failure);

    assert_eq!(
        output_lines(&mut rx),
        vec![
            "job linux-x64 linux".to_string(),
            "job=build (os=linux)".to_string(),
            "token=***".to_string(),
            "step".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_missing_output_path() {
    let harness = Harness::new();
    let mut job = JobTemplate::new("build").step(StepDefinition::new("compile", "true"));
    job.outputs.push(ArtifactOutput {
        name: "core".to_string(),
        path: "bin/core".to_string(),
    });

    let outcome = harness.run(job).await;
    assert_eq!(
        outcome.failure,
        Some(FailureReason::OutputMissing {
            name: "core".to_string(),
            path: "bin/core".to_string(),
        })
    );
}

#[tokio::test]
async fn test_job_timeout() {
    let harness = Harness::new();
    let mut job = JobTemplate::new("build").step(StepDefinition::new("hang", "sleep 30"));
    job.timeout_seconds = Some(1);

    let start = Instant::now();
    let outcome = harness.run(job).await;
    assert_eq!(outcome.failure, Some(FailureReason::TimedOut { after_secs: 1 }));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_step_timeout_is_retried() {
    let harness = Harness::new();
    let mut step = StepDefinition::new("flaky", "if [ -f marker ]; then exit 0; fi; touch marker; sleep 30");
    step.timeout_seconds = Some(1);
    step.retry = Some(RetryConfig {
        max_attempts: 2,
        delay_seconds: 0,
    });

    let outcome = harness.run(JobTemplate::new("build").step(step)).await;
    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(outcome.steps[0].attempts, 2);
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let harness = Harness::new();
    let mut step = StepDefinition::new("broken", "echo attempt >> attempts.log; exit 2");
    step.retry = Some(RetryConfig {
        max_attempts: 3,
        delay_seconds: 0,
    });

    let outcome = harness.run(JobTemplate::new("build").step(step)).await;
    assert_eq!(outcome.steps[0].attempts, 3);
    assert_eq!(outcome.exit_code, Some(2));
}

#[tokio::test]
async fn test_cancellation_stops_running_step() {
    let harness = Harness::new();
    let job = JobTemplate::new("test")
        .step(StepDefinition::new("suite", "sleep 30"))
        .step(StepDefinition::new("after", "true"));
    let request = JobRequest {
        key: JobKey::plain("test"),
        template: Arc::new(job),
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let outcome = harness.executor().execute(&request, &harness.ctx, cancel).await;
    assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(outcome.steps[0].status, StepStatus::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_cache_saved_only_after_success() {
    let harness = Harness::new();
    let spec = CacheSpec {
        key: "deps-${{ matrix.os }}".to_string(),
        path: ".deps".to_string(),
        hash_files: Vec::new(),
        save: true,
    };

    let mut failing = JobTemplate::new("build")
        .step(StepDefinition::new("fetch", "mkdir .deps && echo partial > .deps/index && exit 1"));
    failing.caches.push(spec.clone());
    harness
        .run_keyed(failing, MatrixAssignment::from_pairs([("os", "linux")]))
        .await;
    assert_eq!(harness.cache.get("deps-linux").await, None);

    let mut passing = JobTemplate::new("build")
        .step(StepDefinition::new("fetch", "mkdir .deps && echo full > .deps/index"));
    passing.caches.push(spec.clone());
    let outcome = harness
        .run_keyed(passing, MatrixAssignment::from_pairs([("os", "linux")]))
        .await;
    assert!(outcome.is_success());
    assert!(harness.cache.get("deps-linux").await.is_some());

    let mut restoring = JobTemplate::new("build")
        .step(StepDefinition::new("check", "grep -q full .deps/index"));
    restoring.caches.push(spec);
    let outcome = harness
        .run_keyed(restoring, MatrixAssignment::from_pairs([("os", "linux")]))
        .await;
    assert!(outcome.is_success(), "{:?}", outcome.failure);
}

#[tokio::test]
async fn test_workspace_removed_unless_kept() {
    let removed = Harness::new();
    removed
        .run(JobTemplate::new("build").step(StepDefinition::new("touch", "touch out")))
        .await;
    assert!(!removed.ctx.run_workspace().join("build").exists());

    let kept = Harness::with(|b| b.keep_workspaces(true));
    kept.run(JobTemplate::new("build").step(StepDefinition::new("touch", "touch out")))
        .await;
    assert!(kept.ctx.run_workspace().join("build").join("out").exists());
}

#[tokio::test]
async fn test_job_timeout_during_retry_delay() {
    let harness = Harness::new();
    let mut step = StepDefinition::new("flaky", "exit 1");
    step.retry = Some(RetryConfig {
        max_attempts: 3,
        delay_seconds: 5,
    });
    let mut job = JobTemplate::new("build").step(step);
    job.timeout_seconds = Some(1);

    let start = Instant::now();
    let outcome = harness.run(job).await;
    assert_eq!(outcome.failure, Some(FailureReason::TimedOut { after_secs: 1 }));
    assert_eq!(outcome.steps[0].status, StepStatus::Cancelled);
    assert_eq!(outcome.steps[0].attempts, 1);
    assert!(start.elapsed() < Duration::from_secs(4), "took {:?}", start.elapsed());
}

#[tokio::test]
async fn test_cancel_during_retry_delay_reports_cancelled() {
    let harness = Harness::new();
    let mut step = StepDefinition::new("flaky", "exit 1");
    step.retry = Some(RetryConfig {
        max_attempts: 3,
        delay_seconds: 5,
    });
    let request = JobRequest {
        key: JobKey::plain("build"),
        template: Arc::new(JobTemplate::new("build").step(step)),
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let outcome = harness.executor().execute(&request, &harness.ctx, cancel).await;
    assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
}

/// Never answers a fetch in time.
struct StalledArtifactStore;

#[async_trait::async_trait]
impl ArtifactStore for StalledArtifactStore {
    async fn put(
        &self,
        job: &str,
        name: &str,
        _bytes: Vec<u8>,
    ) -> conduit_core::Result<conduit_core::run::ArtifactHandle> {
        Err(conduit_core::Error::ArtifactExists {
            job: job.to_string(),
            name: name.to_string(),
        })
    }

    async fn fetch(&self, _job: &str, _name: &str) -> conduit_core::Result<Vec<u8>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }

    async fn list(&self) -> conduit_core::Result<Vec<conduit_core::run::ArtifactHandle>> {
        Ok(Vec::new())
    }

    async fn finalize_run(&self) -> conduit_core::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_job_timeout_covers_input_fetch() {
    let harness = Harness::new();
    let mut job = JobTemplate::new("test").step(StepDefinition::new("check", "touch ran"));
    job.timeout_seconds = Some(1);
    job.inputs.push(ArtifactInput {
        job: "build".to_string(),
        name: "core".to_string(),
        path: None,
        required: true,
    });
    let request = JobRequest {
        key: JobKey::plain("test"),
        template: Arc::new(job),
    };

    let start = Instant::now();
    let outcome = JobExecutor::new(Arc::new(StalledArtifactStore), harness.cache.clone())
        .execute(&request, &harness.ctx, CancellationToken::new())
        .await;
    assert_eq!(outcome.failure, Some(FailureReason::TimedOut { after_secs: 1 }));
    assert!(outcome.steps.is_empty());
    assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());
}

#[tokio::test]
async fn test_paths_outside_workspace_are_rejected() {
    let harness = Harness::new();
    let mut step = StepDefinition::new("escape", "touch escaped");
    step.working_directory = Some("${{ matrix.dir }}".to_string());
    let outcome = harness
        .run_keyed(
            JobTemplate::new("build").step(step),
            MatrixAssignment::from_pairs([("dir", "../..")]),
        )
        .await;
    assert!(
        matches!(outcome.failure, Some(FailureReason::Setup { ref message }) if message.contains("outside the workspace")),
        "{:?}",
        outcome.failure
    );
    assert!(outcome.steps.is_empty());

    let mut test = JobTemplate::new("test").step(StepDefinition::new("check", "true"));
    test.inputs.push(ArtifactInput {
        job: "build".to_string(),
        name: "core".to_string(),
        path: Some("/tmp".to_string()),
        required: true,
    });
    let outcome = harness.run(test).await;
    assert!(matches!(outcome.failure, Some(FailureReason::Setup { .. })), "{:?}", outcome.failure);
    assert!(outcome.steps.is_empty());
}
