//! Build states and outcomes.

use super::Artifact;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of one stage's build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Not yet invoked.
    Pending,
    /// Querying the store for an existing artifact.
    Checking,
    /// A matching artifact already exists.
    Skipped,
    /// Compute acquired, transformation and persistence in progress.
    Building,
    /// Finished successfully.
    Done,
    /// Aborted with an error.
    Failed,
}

impl Default for BuildState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Checking => write!(f, "checking"),
            Self::Skipped => write!(f, "skipped"),
            Self::Building => write!(f, "building"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What a successful build task did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    /// The artifact already existed; nothing was started.
    Skipped,
    /// A new artifact was stored.
    Built {
        /// The stored artifact, when the provider could look it up.
        artifact: Option<Artifact>,
    },
}

impl BuildOutcome {
    /// Returns true if a new artifact was produced.
    #[must_use]
    pub fn is_built(&self) -> bool {
        matches!(self, Self::Built { .. })
    }
}
