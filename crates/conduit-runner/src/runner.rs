//! Core step runner trait and types.

use async_trait::async_trait;
use conduit_core::Result;
use conduit_core::events::OutputStream;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// How a step process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTermination {
    Exited(i32),
    /// The step's own timeout expired.
    TimedOut,
    /// The cancellation token fired.
    Cancelled,
}

/// Result of step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub termination: StepTermination,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn exited(exit_code: i32, duration_ms: u64) -> Self {
        Self {
            termination: StepTermination::Exited(exit_code),
            duration_ms,
        }
    }

    pub fn success(&self) -> bool {
        self.termination == StepTermination::Exited(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            StepTermination::Exited(code) => Some(code),
            _ => None,
        }
    }
}

/// Fully resolved input for one step attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Job instance display name, used for logging.
    pub job: String,
    pub step: String,
    /// Command with expressions already substituted.
    pub command: String,
    pub shell: String,
    /// Directory the command runs in.
    pub working_dir: PathBuf,
    /// Composed environment (global, job, matrix, step).
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL when the step is stopped early.
    pub grace_period: Duration,
}

/// Trait for step execution.
///
/// Runners stream output lines as they are produced and must stop the step
/// promptly when `cancel` fires, still reporting the output captured so far.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<StepResult>;
}
