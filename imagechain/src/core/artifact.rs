//! Handles for artifacts, compute instances and provisioning seeds.

use super::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An artifact held by the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Store-assigned identifier.
    pub id: String,
    /// The tags the artifact was stored with.
    pub tags: Fingerprint,
    /// When the artifact was created.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates an artifact handle stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>, tags: Fingerprint) -> Self {
        Self {
            id: id.into(),
            tags,
            created_at: Utc::now(),
        }
    }
}

/// A running compute instance, owned by the executor for one stage build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Provider-assigned identifier.
    pub id: String,
    /// Address the transformation connects to.
    pub address: String,
}

impl InstanceHandle {
    /// Creates a new instance handle.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.address)
    }
}

/// What a compute instance is started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seed {
    /// A base artifact given by identifier.
    Id(String),
    /// The single artifact carrying exactly these tags.
    Fingerprint(Fingerprint),
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Fingerprint(tags) => write!(f, "tags {tags}"),
        }
    }
}
