//! Fingerprints: the cumulative tag sets identifying artifacts.

use crate::stages::ResolvedStage;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag naming the stage an artifact was produced by.
pub const IMAGE_TYPE_TAG: &str = "image_type";

/// An ordered mapping from tag key to tag value.
///
/// Equality ignores insertion order, so two fingerprints with the same
/// entries identify the same artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint {
    tags: IndexMap<String, String>,
}

impl Fingerprint {
    /// Creates an empty fingerprint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tag, overwriting an existing value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns the value of a tag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Returns the `image_type` tag.
    #[must_use]
    pub fn image_type(&self) -> Option<&str> {
        self.get(IMAGE_TYPE_TAG)
    }

    /// Returns the number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Returns true if there are no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterates the tags in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns true if every tag of `other` is present here with the same value.
    #[must_use]
    pub fn contains_all(&self, other: &Self) -> bool {
        other
            .tags
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{key}' => '{value}'")?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Fingerprint {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fingerprint = Self::new();
        for (key, value) in iter {
            fingerprint.insert(key, value);
        }
        fingerprint
    }
}

/// Computes the fingerprint of `stage` given every stage upstream of it.
///
/// Starts from `image_type => stage.name`, adds `stage.name => stage.version`,
/// then one `name => version` entry per upstream stage in the given order.
/// Later entries overwrite earlier ones on key collision.
#[must_use]
pub fn build_fingerprint(stage: &ResolvedStage, upstream: &[ResolvedStage]) -> Fingerprint {
    let mut fingerprint = Fingerprint::new()
        .with_tag(IMAGE_TYPE_TAG, stage.name())
        .with_tag(stage.name(), stage.version());

    for base in upstream {
        fingerprint.insert(base.name(), base.version());
    }

    fingerprint
}
