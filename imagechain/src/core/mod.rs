//! Core types for imagechain.
//!
//! This module provides:
//! - Fingerprints (the tag sets identifying artifacts)
//! - Artifact, instance and seed handles
//! - Build states and outcomes

mod artifact;
mod fingerprint;
mod status;

pub use artifact::{Artifact, InstanceHandle, Seed};
pub use fingerprint::{build_fingerprint, Fingerprint, IMAGE_TYPE_TAG};
pub use status::{BuildOutcome, BuildState};
