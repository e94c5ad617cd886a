//! Chain orchestration.
//!
//! [`TaskGraph`] wires one [`BuildTask`] per stage, [`BuildExecutor`] runs a
//! single task, and [`ImageChain`] ties both to a configuration.

mod chain;
mod executor;
mod graph;
mod integration_tests;

pub use chain::{ImageChain, RunReport, TaskRun};
pub use executor::BuildExecutor;
pub use graph::{BuildTask, TaskGraph};
