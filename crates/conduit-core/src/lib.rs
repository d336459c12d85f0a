//! Conduit Core
//!
//! Domain types, traits and error handling shared by every Conduit crate:
//! pipeline definitions, job instances and their states, the run context,
//! run reports, and the ports implemented by stores, runners and event sinks.

pub mod context;
pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
