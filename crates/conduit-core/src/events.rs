//! Run progress events.

use crate::ids::RunId;
use crate::run::{JobKey, JobState, RunStatus, SkipReason};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        pipeline: String,
        jobs: usize,
    },
    JobReady {
        job: JobKey,
    },
    JobStarted {
        job: JobKey,
    },
    JobFinished {
        job: JobKey,
        state: JobState,
        reason: Option<String>,
        duration_ms: Option<u64>,
    },
    JobSkipped {
        job: JobKey,
        reason: SkipReason,
    },
    /// One captured (already masked) line of step output.
    StepOutput {
        job: JobKey,
        step: String,
        stream: OutputStream,
        line: String,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
    },
}

/// Receives run events as they happen.
///
/// Called from the scheduler loop and from executor tasks, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: RunEvent) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: RunEvent) {
        // Receiver may have been dropped
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelEventSink::channel();
        sink.emit(RunEvent::JobStarted {
            job: JobKey::plain("build"),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            RunEvent::JobStarted {
                job: JobKey::plain("build")
            }
        );
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelEventSink::channel();
        drop(rx);
        sink.emit(RunEvent::JobReady {
            job: JobKey::plain("build"),
        });
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(RunEvent::JobSkipped {
            job: JobKey::plain("release"),
            reason: SkipReason::TriggerFiltered,
        })
        .unwrap();
        assert_eq!(json["type"], "job_skipped");
        assert_eq!(json["reason"]["kind"], "trigger_filtered");
    }
}
