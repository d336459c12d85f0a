//! Conduit CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;
mod output;

use commands::{ArtifactCommands, CacheCommands, Commands, LogFormat};
use config::EngineConfig;
use handlers::RunOptions;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path),
        Commands::Plan { path, trigger, jobs } => handlers::plan(&path, &trigger, &jobs),
        Commands::Run {
            path,
            trigger,
            jobs,
            concurrency,
            format,
            variables,
            secrets,
            keep_workspaces,
        } => {
            handlers::run_pipeline(
                config,
                RunOptions {
                    path,
                    trigger,
                    jobs,
                    concurrency,
                    format,
                    variables,
                    secrets,
                    keep_workspaces,
                },
            )
            .await
        }
        Commands::Artifacts { command } => match command {
            ArtifactCommands::List { run } => handlers::list_artifacts(&config, run.as_deref()).await,
            ArtifactCommands::Prune => handlers::prune_artifacts(&config).await,
        },
        Commands::Cache { command } => match command {
            CacheCommands::List { prefix } => handlers::list_cache(&config, &prefix).await,
            CacheCommands::Clear { prefix } => handlers::clear_cache(&config, prefix.as_deref()).await,
            CacheCommands::Prune => handlers::prune_cache(&config).await,
        },
    }
}
