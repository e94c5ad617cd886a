//! Stages with resolved versions.

use super::{SourceRef, StageSpec, WILDCARD};
use crate::errors::Result;
use crate::providers::VersionProvider;
use serde::Serialize;
use std::ops::Deref;
use std::path::Path;
use tracing::debug;

/// A stage together with the version of its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedStage {
    #[serde(flatten)]
    spec: StageSpec,
    version: String,
}

impl ResolvedStage {
    /// Attaches a version to a stage.
    #[must_use]
    pub fn new(spec: StageSpec, version: impl Into<String>) -> Self {
        Self {
            spec,
            version: version.into(),
        }
    }

    /// The resolved version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The underlying specification.
    #[must_use]
    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }
}

impl Deref for ResolvedStage {
    type Target = StageSpec;

    fn deref(&self) -> &StageSpec {
        &self.spec
    }
}

/// Joins a path-like source with `root`; the wildcard passes through unchanged.
#[must_use]
pub fn resolve_path(source: &SourceRef, root: &Path) -> String {
    match source {
        SourceRef::Wildcard => WILDCARD.to_string(),
        SourceRef::Path(path) => root.join(path).to_string_lossy().into_owned(),
    }
}

/// Resolves one version per stage, in declaration order.
///
/// # Errors
///
/// Propagates the provider's `VersionLookup` error for the first stage
/// that cannot be resolved.
pub async fn resolve_versions(
    stages: Vec<StageSpec>,
    provider: &dyn VersionProvider,
    root: &Path,
) -> Result<Vec<ResolvedStage>> {
    let mut resolved = Vec::with_capacity(stages.len());

    for spec in stages {
        let reference = resolve_path(spec.version_source(), root);
        let version = provider.version_of(&reference).await?;
        debug!(
            stage = %spec.name(),
            reference = %reference,
            version = %version,
            "Resolved stage version"
        );
        resolved.push(ResolvedStage::new(spec, version));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ChainError;
    use crate::providers::MockVersionProvider;
    use crate::stages::normalize;
    use mockall::predicate::eq;
    use std::path::PathBuf;

    #[test]
    fn test_resolve_path() {
        let root = PathBuf::from("/srv/images");
        assert_eq!(resolve_path(&SourceRef::Wildcard, &root), "*");
        assert_eq!(
            resolve_path(&SourceRef::from("base.rb"), &root),
            "/srv/images/base.rb"
        );
        assert_eq!(
            resolve_path(&SourceRef::from("/abs/base.rb"), &root),
            "/abs/base.rb"
        );
    }

    #[tokio::test]
    async fn test_resolves_in_declaration_order() {
        let mut provider = MockVersionProvider::new();
        let mut seq = mockall::Sequence::new();
        for (reference, version) in [("*", "1"), ("/middle_ware.rb", "2"), ("/base.rb", "3")] {
            provider
                .expect_version_of()
                .with(eq(reference))
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(version.to_string()));
        }

        let specs = normalize(["application", "middle_ware", "base"]).unwrap();
        let resolved = resolve_versions(specs, &provider, Path::new("/"))
            .await
            .unwrap();

        let versions: Vec<_> = resolved.iter().map(ResolvedStage::version).collect();
        assert_eq!(versions, vec!["1", "2", "3"]);
        assert_eq!(resolved[0].name(), "application");
    }

    #[tokio::test]
    async fn test_lookup_error_propagates() {
        let mut provider = MockVersionProvider::new();
        provider
            .expect_version_of()
            .returning(|reference| Err(ChainError::version_lookup(reference, "unknown")));

        let specs = normalize(["application"]).unwrap();
        let err = resolve_versions(specs, &provider, Path::new("/"))
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::VersionLookup { .. }));
    }
}
