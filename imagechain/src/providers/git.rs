//! Version provider backed by git history.

use super::VersionProvider;
use crate::errors::{ChainError, Result};
use crate::stages::WILDCARD;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Asks git for the last commit touching a file (or the repository).
#[derive(Debug, Clone)]
pub struct GitVersionProvider {
    program: String,
    working_dir: Option<PathBuf>,
}

impl Default for GitVersionProvider {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            working_dir: None,
        }
    }
}

impl GitVersionProvider {
    /// Creates a provider running `git` in the process working directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different git executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Runs git inside `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn single_version(&self, reference: &str) -> Result<String> {
        let mut command = Command::new(&self.program);
        command.args(["rev-list", "--max-count", "1", "HEAD"]);
        if reference != WILDCARD {
            command.arg("--").arg(reference);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|e| {
            ChainError::version_lookup(reference, format!("failed to run {}: {e}", self.program))
        })?;

        if !output.status.success() {
            return Err(ChainError::version_lookup(
                reference,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if version.is_empty() {
            return Err(ChainError::version_lookup(reference, "no commit touches this path"));
        }

        debug!(reference = %reference, version = %version, "git version");
        Ok(version)
    }

    /// Returns a combined version for several references.
    ///
    /// The references are sorted first, so their order does not matter. A single
    /// reference yields that reference's own version.
    ///
    /// # Errors
    ///
    /// Fails with `VersionLookup` if any reference cannot be resolved.
    pub async fn version_of_many(&self, references: &[&str]) -> Result<String> {
        match references {
            [] => Err(ChainError::version_lookup("", "no references given")),
            [single] => self.single_version(single).await,
            many => {
                let mut sorted = many.to_vec();
                sorted.sort_unstable();

                let mut combined = String::new();
                for reference in sorted {
                    let version = self.single_version(reference).await?;
                    let mut hasher = Sha256::new();
                    hasher.update(combined.as_bytes());
                    hasher.update(version.as_bytes());
                    combined = hex::encode(hasher.finalize());
                }
                Ok(combined)
            }
        }
    }
}

#[async_trait]
impl VersionProvider for GitVersionProvider {
    async fn version_of(&self, reference: &str) -> Result<String> {
        self.single_version(reference).await
    }
}

/// Initializes a git repository in `dir` and commits each file separately.
#[cfg(test)]
pub(crate) fn commit_each(dir: &std::path::Path, files: &[&str]) {
    let git = |args: &[&str]| {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=imagechain", "-c", "user.email=imagechain@localhost"])
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    };

    git(&["init", "--quiet"]);
    for file in files {
        let path = dir.join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("# {file}\n")).unwrap();
        git(&["add", file]);
        git(&["commit", "--quiet", "-m", file]);
    }
}
