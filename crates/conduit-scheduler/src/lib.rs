//! Dependency resolution and scheduling for Conduit pipelines.

pub mod dag;
pub mod matrix;
pub mod queue;
pub mod scheduler;
pub mod triggers;

pub use dag::{DagBuilder, DagError, DagNode, PipelineDag};
pub use matrix::MatrixExpander;
pub use queue::{QueueManager, QueuedJob};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use triggers::TriggerMatcher;
