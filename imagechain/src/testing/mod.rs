//! Testing utilities for imagechain.
//!
//! This module provides:
//! - In-memory collaborators recording every call
//! - A standard three-stage chain fixture

mod fixtures;
mod mocks;

pub use fixtures::ChainFixture;
pub use mocks::{
    ComputeCall, InMemoryCompute, RecordedTransform, RecordingTransformExecutor,
    TableVersionProvider,
};
