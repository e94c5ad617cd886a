//! Error types for imagechain.
//!
//! Definition-time errors (bad stage declarations, bad options, failed version
//! lookups) are raised before any task runs. Build-time errors are raised by
//! the executor after the compute instance of the failing stage was released.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ChainError> = std::result::Result<T, E>;

/// The main error type for imagechain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A stage declaration or option was malformed.
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// What was wrong.
        message: String,
    },

    /// The version provider could not resolve a reference.
    #[error("Version lookup failed for '{reference}': {message}")]
    VersionLookup {
        /// The reference passed to the provider.
        reference: String,
        /// Provider message.
        message: String,
    },

    /// A collaborator or option is missing or not recognized.
    #[error("Configuration error: {message}")]
    Configuration {
        /// What was wrong.
        message: String,
    },

    /// Compute could not be acquired.
    #[error("Provisioning failed for stage '{stage}': {message}")]
    Provision {
        /// The stage being built.
        stage: String,
        /// Provider message.
        message: String,
    },

    /// The transformation procedure failed.
    #[error("Transformation failed for stage '{stage}': {message}")]
    Transform {
        /// The stage being built.
        stage: String,
        /// Executor message.
        message: String,
    },

    /// The artifact could not be persisted.
    #[error("Persisting artifact failed for stage '{stage}': {message}")]
    Persist {
        /// The stage being built.
        stage: String,
        /// Provider message.
        message: String,
    },

    /// No artifact matches the upstream fingerprint.
    #[error("No artifact found for tags {tags}")]
    ArtifactNotFound {
        /// Rendered fingerprint.
        tags: String,
    },

    /// More than one artifact matches the upstream fingerprint.
    #[error("{count} artifacts are tagged with {tags}")]
    AmbiguousArtifact {
        /// Rendered fingerprint.
        tags: String,
        /// Number of matches.
        count: usize,
    },

    /// Settings could not be parsed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Creates an invalid input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a version lookup error.
    #[must_use]
    pub fn version_lookup(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::VersionLookup {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a provisioning error.
    #[must_use]
    pub fn provision(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provision {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates a transformation error.
    #[must_use]
    pub fn transform(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates a persistence error.
    #[must_use]
    pub fn persist(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persist {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Returns a stable code for the error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "CHAIN-INPUT",
            Self::VersionLookup { .. } => "CHAIN-VERSION",
            Self::Configuration { .. } => "CHAIN-CONFIG",
            Self::Provision { .. } => "CHAIN-PROVISION",
            Self::Transform { .. } => "CHAIN-TRANSFORM",
            Self::Persist { .. } => "CHAIN-PERSIST",
            Self::ArtifactNotFound { .. } => "CHAIN-ARTIFACT-NOT-FOUND",
            Self::AmbiguousArtifact { .. } => "CHAIN-ARTIFACT-AMBIGUOUS",
            Self::Serialization(_) => "CHAIN-SERIALIZATION",
            Self::Io(_) => "CHAIN-IO",
        }
    }

    /// Returns true for errors raised while defining a chain, before any build.
    #[must_use]
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. }
                | Self::VersionLookup { .. }
                | Self::Configuration { .. }
                | Self::Serialization(_)
        )
    }

    /// Returns the stage the error is attributed to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Provision { stage, .. }
            | Self::Transform { stage, .. }
            | Self::Persist { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), Value::String(self.code().to_string()));
        map.insert("message".to_string(), Value::String(self.to_string()));
        if let Some(stage) = self.stage() {
            map.insert("stage".to_string(), Value::String(stage.to_string()));
        }
        map
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
