//! Command handlers.

use crate::commands::{OutputFormat, TriggerArgs};
use crate::config::EngineConfig;
use crate::output;
use anyhow::Context;
use chrono::Utc;
use conduit_cache::{FilesystemArtifactStore, FilesystemCacheStore};
use conduit_core::context::{RunContext, TriggerEvent};
use conduit_core::events::{ChannelEventSink, EventSink};
use conduit_core::pipeline::PipelineDefinition;
use conduit_core::run::RunStatus;
use conduit_runner::JobExecutor;
use conduit_scheduler::{DagBuilder, Scheduler, SchedulerConfig};
use console::style;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Options for `conduit run`.
pub struct RunOptions {
    pub path: PathBuf,
    pub trigger: TriggerArgs,
    pub jobs: Vec<String>,
    pub concurrency: Option<usize>,
    pub format: OutputFormat,
    pub variables: Vec<(String, String)>,
    pub secrets: Vec<String>,
    pub keep_workspaces: bool,
}

pub fn load_definition(path: &Path) -> anyhow::Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    PipelineDefinition::from_yaml(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Process exit code for a finished run.
pub fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded | RunStatus::Neutral => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::from(1),
    }
}

/// Validate a pipeline configuration.
pub fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let definition = load_definition(path)?;
    let dag = DagBuilder::new().build(&definition, &TriggerEvent::manual())?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Jobs: {}", definition.jobs.len());
    for job in &definition.jobs {
        let instances = dag.instances(&job.name).count();
        if instances > 1 {
            println!("    - {} ({} steps, {} instances)", job.name, job.steps.len(), instances);
        } else {
            println!("    - {} ({} steps)", job.name, job.steps.len());
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Print the resolved execution plan.
pub fn plan(path: &Path, trigger: &TriggerArgs, jobs: &[String]) -> anyhow::Result<ExitCode> {
    let definition = load_definition(path)?;
    let dag = DagBuilder::new()
        .select(jobs.iter().cloned())
        .build(&definition, &trigger.to_event())?;
    output::print_plan(&dag);
    Ok(ExitCode::SUCCESS)
}

/// Run a pipeline locally.
pub async fn run_pipeline(config: EngineConfig, options: RunOptions) -> anyhow::Result<ExitCode> {
    let definition = load_definition(&options.path)?;
    let config = config.with_concurrency(options.concurrency);
    let trigger = options.trigger.to_event();
    let dag = DagBuilder::new()
        .select(options.jobs.iter().cloned())
        .build(&definition, &trigger)?;

    let mut secrets = HashMap::new();
    for name in &options.secrets {
        let value = std::env::var(name).with_context(|| format!("secret variable {} is not set", name))?;
        secrets.insert(name.clone(), value);
    }

    let mut builder = RunContext::builder(&definition)
        .trigger(trigger)
        .secrets(secrets)
        .workspace_root(config.workspace_root())
        .grace_period(config.grace_period())
        .default_step_timeout(config.default_step_timeout())
        .keep_workspaces(options.keep_workspaces || config.keep_workspaces);
    for (key, value) in options.variables {
        builder = builder.variable(key, value);
    }
    let ctx = Arc::new(builder.build());

    let retention_days = config
        .artifact_retention_days
        .unwrap_or(definition.artifacts.retention_days);
    let artifacts = Arc::new(FilesystemArtifactStore::new(
        config.artifact_root(),
        ctx.run_id,
        retention_days,
    ));
    let cache = Arc::new(
        FilesystemCacheStore::new(config.cache_root())
            .with_compression(config.cache_compression)
            .with_ttl_days(config.cache_ttl_days),
    );

    let (sink, events) = ChannelEventSink::channel();
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let printer = match options.format {
        OutputFormat::Table => Some(tokio::spawn(output::print_progress(events))),
        OutputFormat::Json => None,
    };

    let executor = JobExecutor::new(artifacts.clone(), cache).with_events(Arc::clone(&sink));
    let scheduler = Scheduler::new(
        Arc::new(executor),
        SchedulerConfig {
            max_concurrency: config.max_concurrency,
            resource_limits: config.resource_limits.clone(),
        },
    )
    .with_events(sink)
    .with_artifact_store(artifacts);

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    info!(run_id = %ctx.run_id, pipeline = %definition.name, "Run started");
    let report = scheduler.execute(&definition, &dag, ctx, cancel).await;
    interrupt.abort();

    // Closing the event channel lets the printer drain and exit.
    drop(scheduler);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    output::print_report(&report, options.format)?;
    Ok(exit_code(report.status))
}

/// List artifacts by run.
pub async fn list_artifacts(config: &EngineConfig, run: Option<&str>) -> anyhow::Result<ExitCode> {
    let root = config.artifact_root();
    let runs = FilesystemArtifactStore::list_runs(&root).await?;
    let runs: Vec<_> = runs
        .into_iter()
        .filter(|r| run.is_none_or(|id| r.run_id == id))
        .collect();

    if runs.is_empty() {
        println!("{} No artifacts in {}", style("i").blue(), root.display());
        return Ok(ExitCode::SUCCESS);
    }

    for entry in runs {
        let expires = entry
            .expires_at
            .map(|t| format!("expires {}", t.format("%Y-%m-%d")))
            .unwrap_or_else(|| "not finalized".to_string());
        println!("{} {}", style(&entry.run_id).bold(), style(expires).dim());
        for artifact in &entry.artifacts {
            println!(
                "  {:<40} {:>10}  {}",
                artifact.reference.to_string(),
                output::format_bytes(artifact.size_bytes),
                style(&artifact.sha256[..artifact.sha256.len().min(12)]).dim()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Delete runs whose retention has expired.
pub async fn prune_artifacts(config: &EngineConfig) -> anyhow::Result<ExitCode> {
    let removed = FilesystemArtifactStore::prune_expired(&config.artifact_root(), Utc::now()).await?;
    for run_id in &removed {
        println!("  {} {}", style("-").dim(), run_id);
    }
    println!("{} Pruned {} runs", style("✓").green(), removed.len());
    Ok(ExitCode::SUCCESS)
}

fn cache_store(config: &EngineConfig) -> FilesystemCacheStore {
    FilesystemCacheStore::new(config.cache_root())
        .with_compression(config.cache_compression)
        .with_ttl_days(config.cache_ttl_days)
}

/// List cache entries.
pub async fn list_cache(config: &EngineConfig, prefix: &str) -> anyhow::Result<ExitCode> {
    let store = cache_store(config);
    let entries = store.list(prefix).await?;

    if entries.is_empty() {
        println!("{} No cache entries", style("i").blue());
        return Ok(ExitCode::SUCCESS);
    }

    let now = Utc::now();
    for entry in entries {
        let note = if entry.is_expired(now) { " (expired)" } else { "" };
        println!(
            "  {:<48} {:>10}  {}{}",
            entry.key,
            output::format_bytes(entry.size_bytes),
            style(entry.created_at.format("%Y-%m-%d %H:%M")).dim(),
            style(note).yellow()
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Clear cache.
pub async fn clear_cache(config: &EngineConfig, prefix: Option<&str>) -> anyhow::Result<ExitCode> {
    match prefix {
        Some(p) => println!("Clearing cache with prefix {}...", style(p).bold()),
        None => println!("Clearing all cache..."),
    }
    let removed = cache_store(config).clear(prefix.unwrap_or_default()).await?;
    println!("{} Removed {} entries", style("✓").green(), removed);
    Ok(ExitCode::SUCCESS)
}

/// Delete expired cache entries.
pub async fn prune_cache(config: &EngineConfig) -> anyhow::Result<ExitCode> {
    let removed = cache_store(config).prune_expired().await?;
    println!("{} Pruned {} expired entries", style("✓").green(), removed);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::TriggerArgs;
    use conduit_core::pipeline::TriggerType;

    const PIPELINE: &str = r#"
name: local
jobs:
  - name: build
    steps:
      - name: compile
        run: mkdir -p out && echo "$GREETING" > out/msg
    outputs:
      - name: msg
        path: out/msg
  - name: check
    needs: [build]
    inputs:
      - job: build
        name: msg
    steps:
      - name: verify
        run: grep -q hello out/msg
"#;

    fn manual() -> TriggerArgs {
        TriggerArgs {
            event: TriggerType::Manual,
            branch: None,
            sha: None,
            tag: None,
        }
    }

    fn setup(pipeline: &str) -> (tempfile::TempDir, PathBuf, EngineConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.yaml");
        std::fs::write(&path, pipeline).unwrap();
        let config = EngineConfig {
            workspace_root: Some(dir.path().join("ws")),
            artifact_root: Some(dir.path().join("artifacts")),
            cache_root: Some(dir.path().join("cache")),
            grace_period_secs: 1,
            ..Default::default()
        };
        (dir, path, config)
    }

    fn options(path: PathBuf) -> RunOptions {
        RunOptions {
            path,
            trigger: manual(),
            jobs: vec![],
            concurrency: Some(2),
            format: OutputFormat::Json,
            variables: vec![("GREETING".to_string(), "hello".to_string())],
            secrets: vec![],
            keep_workspaces: false,
        }
    }

    #[tokio::test]
    async fn test_run_pipeline_succeeds() {
        let (dir, path, config) = setup(PIPELINE);

        let code = run_pipeline(config.clone(), options(path)).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        let runs = FilesystemArtifactStore::list_runs(&dir.path().join("artifacts"))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].artifacts.len(), 1);
        assert!(runs[0].expires_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_exits_with_one() {
        let (_dir, path, config) = setup(PIPELINE);
        let mut options = options(path);
        options.variables.clear();

        let code = run_pipeline(config, options).await.unwrap();
        assert_eq!(code, ExitCode::from(1));
    }

    #[tokio::test]
    async fn test_cycle_is_an_error() {
        let (_dir, path, config) = setup(
            "name: bad\njobs:\n  - name: a\n    needs: [a]\n    steps: [{ name: x, run: \"true\" }]\n",
        );
        assert!(run_pipeline(config, options(path.clone())).await.is_err());
        assert!(validate(&path).is_err());
    }

    #[test]
    fn test_validate_and_plan() {
        let (_dir, path, _config) = setup(PIPELINE);
        assert_eq!(validate(&path).unwrap(), ExitCode::SUCCESS);
        assert_eq!(plan(&path, &manual(), &["check".to_string()]).unwrap(), ExitCode::SUCCESS);
        assert!(plan(&path, &manual(), &["nope".to_string()]).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_definition(Path::new("/nonexistent/conduit.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
