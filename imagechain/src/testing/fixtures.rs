//! A ready-made three-stage chain for tests.

use std::sync::Arc;

use crate::config::{ChainConfig, ChainOptions};
use crate::errors::Result;
use crate::events::CollectingEventSink;
use crate::pipeline::{ImageChain, RunReport};

use super::{InMemoryCompute, RecordingTransformExecutor, TableVersionProvider};

/// The `[application, middle_ware, base]` chain with versions 1, 2 and 3.
///
/// Sources live under `/`, the root stage starts from [`Self::BASE_ARTIFACT`].
pub struct ChainFixture {
    /// Version table.
    pub versions: Arc<TableVersionProvider>,
    /// Compute and artifact store.
    pub compute: Arc<InMemoryCompute>,
    /// Transformation recorder.
    pub transform: Arc<RecordingTransformExecutor>,
    /// Collected events.
    pub events: Arc<CollectingEventSink>,
    /// Configuration with every collaborator set.
    pub config: ChainConfig,
}

impl ChainFixture {
    /// Stage names, entry stage first.
    pub const STAGES: [&'static str; 3] = ["application", "middle_ware", "base"];
    /// Base artifact of the root stage.
    pub const BASE_ARTIFACT: &'static str = "ami-6d555119";
    /// Root path stage sources are relative to.
    pub const ROOT: &'static str = "/";

    /// Creates the fixture with an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(InMemoryCompute::new(), RecordingTransformExecutor::new())
    }

    /// Creates the fixture around the given compute and transform mocks.
    #[must_use]
    pub fn with_parts(compute: InMemoryCompute, transform: RecordingTransformExecutor) -> Self {
        // The first stage is versioned by the whole tree.
        let versions = TableVersionProvider::new()
            .with_version("*", "1")
            .with_version("/application.rb", "1")
            .with_version("/middle_ware.rb", "2")
            .with_version("/base.rb", "3");

        let mut fixture = Self {
            versions: Arc::new(versions),
            compute: Arc::new(compute),
            transform: Arc::new(transform),
            events: Arc::new(CollectingEventSink::new()),
            config: ChainConfig::new(),
        };
        fixture.config = ChainConfig::new().with_event_sink(fixture.events.clone());
        fixture.config.set_defaults(&fixture.options());
        fixture
    }

    /// Fails transformations of `stage`.
    #[must_use]
    pub fn failing(stage: &str) -> Self {
        Self::with_parts(
            InMemoryCompute::new(),
            RecordingTransformExecutor::new().fail_for(stage),
        )
    }

    /// Options carrying every collaborator of this fixture.
    #[must_use]
    pub fn options(&self) -> ChainOptions {
        ChainOptions::new()
            .with_version_provider(self.versions.clone())
            .with_compute_provider(self.compute.clone())
            .with_transform_executor(self.transform.clone())
            .with_base_artifact(Self::BASE_ARTIFACT)
            .with_root_path(Self::ROOT)
    }

    /// Sets the version of `reference`, e.g. `/middle_ware.rb`.
    pub fn set_version(&self, reference: &str, version: &str) {
        self.versions.set_version(reference, version);
    }

    /// Defines the standard chain.
    ///
    /// # Errors
    ///
    /// See [`ImageChain::define`].
    pub async fn define(&self) -> Result<ImageChain> {
        ImageChain::define(Self::STAGES, &self.config, &ChainOptions::new()).await
    }

    /// Defines the standard chain and invokes its entry task.
    ///
    /// # Errors
    ///
    /// See [`ImageChain::invoke`].
    pub async fn run(&self) -> Result<RunReport> {
        self.define().await?.invoke(Self::STAGES[0]).await
    }
}

impl Default for ChainFixture {
    fn default() -> Self {
        Self::new()
    }
}
