//! Job and step execution for Conduit.
//!
//! A [`JobExecutor`] takes one job instance through workspace setup, input
//! artifacts, cache restore, its steps, output upload, cache save and
//! cleanup. Steps themselves run through a [`StepRunner`].

pub mod environments;
pub mod executor;
pub mod runner;
pub mod shell;

pub use environments::{Environment, HostEnvironment};
pub use executor::JobExecutor;
pub use runner::{OutputLine, StepContext, StepResult, StepRunner, StepTermination};
pub use shell::ShellRunner;
