//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use conduit_core::context::TriggerEvent;
use conduit_core::pipeline::TriggerType;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate pipeline configuration
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "conduit.yaml")]
        path: PathBuf,
    },

    /// Print the execution order and matrix instances
    Plan {
        /// Path to pipeline file
        #[arg(default_value = "conduit.yaml")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Only these jobs and their prerequisites
        #[arg(short, long = "job")]
        jobs: Vec<String>,
    },

    /// Run a pipeline locally
    Run {
        /// Path to pipeline file
        #[arg(default_value = "conduit.yaml")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Only these jobs and their prerequisites
        #[arg(short, long = "job")]
        jobs: Vec<String>,

        /// Maximum concurrently running jobs
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Report format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Extra variables (KEY=VALUE)
        #[arg(long = "var", value_parser = parse_key_value)]
        variables: Vec<(String, String)>,

        /// Pass an environment variable through as a masked secret
        #[arg(long = "secret-env")]
        secrets: Vec<String>,

        /// Keep job workspaces after the run
        #[arg(long)]
        keep_workspaces: bool,
    },

    /// Manage stored artifacts
    Artifacts {
        #[command(subcommand)]
        command: ArtifactCommands,
    },

    /// Manage cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
pub enum ArtifactCommands {
    /// List artifacts by run
    List {
        /// Only this run
        #[arg(long)]
        run: Option<String>,
    },

    /// Delete runs whose retention has expired
    Prune,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cache entries
    List {
        /// Cache key prefix
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Clear cache
    Clear {
        /// Cache key prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Delete expired entries
    Prune,
}

/// The event a run is triggered by.
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Trigger event: manual, push, pull_request or tag
    #[arg(long, default_value = "manual")]
    pub event: TriggerType,

    /// Branch the event refers to
    #[arg(long)]
    pub branch: Option<String>,

    /// Commit SHA
    #[arg(long)]
    pub sha: Option<String>,

    /// Tag name for tag events
    #[arg(long)]
    pub tag: Option<String>,
}

impl TriggerArgs {
    pub fn to_event(&self) -> TriggerEvent {
        TriggerEvent {
            kind: self.event,
            branch: self.branch.clone(),
            sha: self.sha.clone(),
            tag: self.tag.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("MODE=release=1").unwrap(),
            ("MODE".to_string(), "release=1".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_trigger_args_to_event() {
        let args = TriggerArgs {
            event: TriggerType::Push,
            branch: Some("main".to_string()),
            sha: Some("abc123".to_string()),
            tag: None,
        };
        let event = args.to_event();
        assert_eq!(event.kind, TriggerType::Push);
        assert_eq!(event.branch.as_deref(), Some("main"));
        assert_eq!(event.sha.as_deref(), Some("abc123"));
    }
}
