//! Collaborator interfaces the orchestrator builds against.
//!
//! The core never talks to a version control system, a cloud or a
//! provisioning tool directly. It goes through these three capabilities,
//! each with one implementation per backend and a mock in [`crate::testing`].

mod command;
mod git;

pub use command::{CommandSettings, CommandTransformExecutor, DEFAULT_FAILURE_MARKER};
pub use git::GitVersionProvider;

#[cfg(test)]
pub(crate) use git::commit_each;

use crate::core::{Artifact, Fingerprint, InstanceHandle, Seed};
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resolves the version of a source reference.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionProvider: Send + Sync {
    /// Returns the current version of `reference`.
    ///
    /// The wildcard reference (`*`) means the whole source tree. Must be
    /// deterministic for a fixed repository state.
    async fn version_of(&self, reference: &str) -> Result<String>;
}

/// Starts and stops compute, and creates, inspects and deletes artifacts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Starts an instance from `seed` and waits until it is usable.
    ///
    /// Must not leave an instance running when it fails.
    async fn start_instance(&self, seed: &Seed) -> Result<InstanceHandle>;

    /// Stores the instance as a new artifact tagged with `tags`.
    ///
    /// Stops the instance as part of the call, on success and on failure.
    async fn store_artifact(&self, instance: &InstanceHandle, tags: &Fingerprint) -> Result<()>;

    /// Stops an instance. Best effort: never fails, even if already stopped.
    async fn stop_instance(&self, instance: &InstanceHandle);

    /// Returns true if an artifact with exactly these tags exists.
    async fn exists(&self, tags: &Fingerprint) -> Result<bool>;

    /// Returns the single artifact carrying all of `tags`.
    ///
    /// Fails with `AmbiguousArtifact` when more than one artifact matches.
    async fn find_by_tags(&self, tags: &Fingerprint) -> Result<Option<Artifact>>;

    /// Deletes every artifact carrying all of `tags`, returning how many.
    async fn delete_artifacts(&self, tags: &Fingerprint) -> Result<usize>;
}

/// What the transformation executor is asked to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRequest {
    /// Stage name.
    pub name: String,
    /// Transformation procedure, resolved against the root path.
    pub transform_source: String,
    /// Fingerprint the resulting artifact will carry.
    pub tags: Fingerprint,
    /// The stage's own version.
    pub version: String,
}

/// Applies a stage's transformation to a running instance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransformExecutor: Send + Sync {
    /// Runs the transformation against the instance reachable at `target_address`.
    async fn execute(&self, request: &TransformRequest, target_address: &str) -> Result<()>;
}
