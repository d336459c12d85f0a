//! Shell-based step execution on the host.

use crate::runner::{OutputLine, StepContext, StepResult, StepRunner, StepTermination};
use async_trait::async_trait;
use conduit_core::events::OutputStream;
use conduit_core::{Error, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs each step as `<shell> -c <command>` in its own process group.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

async fn stream_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_number = 0u32;

    while let Ok(Some(content)) = lines.next_line().await {
        line_number += 1;
        let line = OutputLine {
            stream,
            content,
            line_number,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Wait until both output readers hit EOF.
async fn drain_output(readers: &mut JoinSet<()>) {
    while let Some(joined) = readers.join_next().await {
        if let Err(e) = joined
            && !e.is_cancelled()
        {
            warn!(error = %e, "Output reader failed");
        }
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<StepResult> {
        let start = Instant::now();

        info!(
            job = %ctx.job,
            step = %ctx.step,
            working_dir = %ctx.working_dir.display(),
            "Executing shell command"
        );

        let mut command = Command::new(&ctx.shell);
        command
            .arg("-c")
            .arg(&ctx.command)
            .current_dir(&ctx.working_dir)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{} -c: {}", ctx.shell, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("stderr was not captured".to_string()))?;

        // The shell leads its own group, so the pid stays valid as the pgid
        // for whatever it leaves behind.
        let pgid = child.id();

        let mut readers = JoinSet::new();
        readers.spawn(stream_lines(stdout, OutputStream::Stdout, output_tx.clone()));
        readers.spawn(stream_lines(stderr, OutputStream::Stderr, output_tx));

        let termination = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::Spawn(format!("failed to wait for step: {}", e)))?;
                StepTermination::Exited(exit_code(status))
            }
            _ = tokio::time::sleep(ctx.timeout) => {
                warn!(job = %ctx.job, step = %ctx.step, timeout_secs = ctx.timeout.as_secs(), "Step timed out");
                terminate_process_group(&mut child, ctx.grace_period).await;
                StepTermination::TimedOut
            }
            _ = cancel.cancelled() => {
                info!(job = %ctx.job, step = %ctx.step, "Step cancelled");
                terminate_process_group(&mut child, ctx.grace_period).await;
                StepTermination::Cancelled
            }
        };

        // Background processes the step started keep the pipes open after
        // the shell exits. They get the grace period, then the group goes.
        let termination = match termination {
            StepTermination::Exited(code) => {
                let lingering = tokio::select! {
                    _ = drain_output(&mut readers) => None,
                    _ = tokio::time::sleep(ctx.grace_period) => Some(StepTermination::Exited(code)),
                    _ = cancel.cancelled() => Some(StepTermination::Cancelled),
                };
                match lingering {
                    None => StepTermination::Exited(code),
                    Some(termination) => {
                        warn!(job = %ctx.job, step = %ctx.step, "Step left processes running, terminating them");
                        if let Some(pgid) = pgid {
                            terminate_leftovers(pgid, &mut readers, ctx.grace_period).await;
                        }
                        termination
                    }
                }
            }
            other => other,
        };

        if tokio::time::timeout(ctx.grace_period, drain_output(&mut readers))
            .await
            .is_err()
        {
            warn!(job = %ctx.job, step = %ctx.step, "Output still open after termination, dropping it");
            readers.abort_all();
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(job = %ctx.job, step = %ctx.step, ?termination, duration_ms, "Step finished");

        Ok(StepResult {
            termination,
            duration_ms,
        })
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    if let Err(e) = nix::sys::signal::killpg(Pid::from_raw(pgid as i32), signal)
        && e != Errno::ESRCH
    {
        warn!(pgid, ?signal, error = ?e, "Signal to process group failed");
    }
}

/// Stop a step's process group.
///
/// On Unix:
/// 1. Send SIGTERM to the process group
/// 2. Wait up to the grace period for the shell to exit
/// 3. Send SIGKILL to whatever is left of the group
/// 4. Reap the shell
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, grace: Duration) {
    use nix::sys::signal::Signal;

    let Some(pid) = child.id() else {
        return; // Already exited
    };

    signal_group(pid, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid, grace_secs = grace.as_secs(), "Step ignored SIGTERM, killing");
    }

    // Children that outlived the shell would keep the output pipes open.
    signal_group(pid, Signal::SIGKILL);
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Stop processes left in the group after the shell itself exited.
#[cfg(unix)]
async fn terminate_leftovers(pgid: u32, readers: &mut JoinSet<()>, grace: Duration) {
    use nix::sys::signal::Signal;

    signal_group(pgid, Signal::SIGTERM);
    if tokio::time::timeout(grace, drain_output(readers)).await.is_err() {
        signal_group(pgid, Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn terminate_leftovers(_pgid: u32, _readers: &mut JoinSet<()>, _grace: Duration) {}
