//! Stateful in-memory collaborators for testing chains.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::core::{Artifact, Fingerprint, InstanceHandle, Seed};
use crate::errors::{ChainError, Result};
use crate::providers::{ComputeProvider, TransformExecutor, TransformRequest, VersionProvider};
use crate::utils::{poll_until, PollTimeout, DEFAULT_POLL_INTERVAL, INSTANCE_STARTUP_TIMEOUT};

/// A version provider answering from a fixed table.
#[derive(Debug, Default)]
pub struct TableVersionProvider {
    versions: RwLock<HashMap<String, String>>,
    lookups: Mutex<Vec<String>>,
}

impl TableVersionProvider {
    /// Creates a provider that knows no reference.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a version for `reference`.
    #[must_use]
    pub fn with_version(self, reference: impl Into<String>, version: impl Into<String>) -> Self {
        self.set_version(reference, version);
        self
    }

    /// Sets or replaces the version of `reference`.
    pub fn set_version(&self, reference: impl Into<String>, version: impl Into<String>) {
        self.versions.write().insert(reference.into(), version.into());
    }

    /// References looked up so far, in call order.
    #[must_use]
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl VersionProvider for TableVersionProvider {
    async fn version_of(&self, reference: &str) -> Result<String> {
        self.lookups.lock().push(reference.to_string());
        self.versions
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| ChainError::version_lookup(reference, "unknown reference"))
    }
}

/// A call made to [`InMemoryCompute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeCall {
    /// `start_instance`.
    StartInstance(Seed),
    /// `store_artifact`.
    StoreArtifact {
        /// Instance id.
        instance: String,
        /// Tags of the new artifact.
        tags: Fingerprint,
    },
    /// `stop_instance` with the instance id.
    StopInstance(String),
    /// `exists`.
    Exists(Fingerprint),
    /// `find_by_tags`.
    FindByTags(Fingerprint),
    /// `delete_artifacts`.
    DeleteArtifacts(Fingerprint),
}

impl ComputeCall {
    /// The provider method name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartInstance(_) => "start_instance",
            Self::StoreArtifact { .. } => "store_artifact",
            Self::StopInstance(_) => "stop_instance",
            Self::Exists(_) => "exists",
            Self::FindByTags(_) => "find_by_tags",
            Self::DeleteArtifacts(_) => "delete_artifacts",
        }
    }
}

#[derive(Debug, Default)]
struct ComputeState {
    next_id: u64,
    artifacts: Vec<Artifact>,
    running: IndexMap<String, InstanceHandle>,
    calls: Vec<ComputeCall>,
}

impl ComputeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn matching(&self, tags: &Fingerprint) -> Vec<&Artifact> {
        self.artifacts
            .iter()
            .filter(|a| a.tags.contains_all(tags))
            .collect()
    }
}

/// A compute provider and artifact store kept in memory.
///
/// Instances and snapshots can be made to stay pending for a number of
/// checks, which exercises the bounded wait of the real backends.
#[derive(Debug)]
pub struct InMemoryCompute {
    state: Mutex<ComputeState>,
    pending_polls: u32,
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for InMemoryCompute {
    fn default() -> Self {
        Self {
            state: Mutex::new(ComputeState::default()),
            pending_polls: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: INSTANCE_STARTUP_TIMEOUT,
        }
    }
}

impl InMemoryCompute {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an existing artifact.
    #[must_use]
    pub fn with_artifact(self, id: impl Into<String>, tags: Fingerprint) -> Self {
        self.state.lock().artifacts.push(Artifact::new(id, tags));
        self
    }

    /// Keeps instances and snapshots pending for `polls` checks.
    #[must_use]
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Sets the maximum wait for a pending instance or snapshot.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// All stored artifacts.
    #[must_use]
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.state.lock().artifacts.clone()
    }

    /// Number of stored artifacts.
    #[must_use]
    pub fn artifact_count(&self) -> usize {
        self.state.lock().artifacts.len()
    }

    /// Returns true if an artifact carries exactly `tags`.
    #[must_use]
    pub fn has_artifact(&self, tags: &Fingerprint) -> bool {
        self.state.lock().artifacts.iter().any(|a| &a.tags == tags)
    }

    /// Instances currently running.
    #[must_use]
    pub fn running_instances(&self) -> Vec<InstanceHandle> {
        self.state.lock().running.values().cloned().collect()
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ComputeCall> {
        self.state.lock().calls.clone()
    }

    /// Method names of every call made so far.
    #[must_use]
    pub fn call_names(&self) -> Vec<&'static str> {
        self.state.lock().calls.iter().map(ComputeCall::name).collect()
    }

    /// Stops a running instance, failing if it is not running.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the instance is unknown or already stopped.
    pub fn stop_running(&self, instance: &InstanceHandle) -> Result<()> {
        self.state
            .lock()
            .running
            .shift_remove(&instance.id)
            .map(|_| ())
            .ok_or_else(|| {
                ChainError::invalid_input(format!("instance {} is not running", instance.id))
            })
    }

    fn record(&self, call: ComputeCall) {
        self.state.lock().calls.push(call);
    }

    async fn settle(&self) -> std::result::Result<(), PollTimeout> {
        let mut remaining = self.pending_polls;
        poll_until(self.timeout, self.poll_interval, || {
            let ready = remaining == 0;
            remaining = remaining.saturating_sub(1);
            async move { ready.then_some(()) }
        })
        .await
    }
}

#[async_trait]
impl ComputeProvider for InMemoryCompute {
    async fn start_instance(&self, seed: &Seed) -> Result<InstanceHandle> {
        self.record(ComputeCall::StartInstance(seed.clone()));

        if let Seed::Fingerprint(tags) = seed {
            if self.find_by_tags(tags).await?.is_none() {
                return Err(ChainError::ArtifactNotFound {
                    tags: tags.to_string(),
                });
            }
        }

        self.settle().await.map_err(|e| {
            ChainError::provision(seed.to_string(), format!("instance did not start: {e}"))
        })?;

        let mut state = self.state.lock();
        let n = state.next_id();
        let instance = InstanceHandle::new(format!("i-{n}"), format!("10.0.0.{n}"));
        state.running.insert(instance.id.clone(), instance.clone());
        debug!(instance = %instance, seed = %seed, "Started instance");
        Ok(instance)
    }

    async fn store_artifact(&self, instance: &InstanceHandle, tags: &Fingerprint) -> Result<()> {
        self.record(ComputeCall::StoreArtifact {
            instance: instance.id.clone(),
            tags: tags.clone(),
        });

        if !self.state.lock().running.contains_key(&instance.id) {
            return Err(ChainError::persist(&instance.id, "instance is not running"));
        }

        let settled = self.settle().await;

        let mut state = self.state.lock();
        state.running.shift_remove(&instance.id);
        settled.map_err(|e| {
            ChainError::persist(&instance.id, format!("snapshot stayed pending: {e}"))
        })?;

        let n = state.next_id();
        state.artifacts.push(Artifact::new(format!("img-{n}"), tags.clone()));
        Ok(())
    }

    async fn stop_instance(&self, instance: &InstanceHandle) {
        self.record(ComputeCall::StopInstance(instance.id.clone()));
        if self.state.lock().running.shift_remove(&instance.id).is_none() {
            debug!(instance = %instance.id, "Instance already stopped");
        }
    }

    async fn exists(&self, tags: &Fingerprint) -> Result<bool> {
        self.record(ComputeCall::Exists(tags.clone()));
        if tags.is_empty() {
            return Err(ChainError::invalid_input("cannot look up an artifact without tags"));
        }
        Ok(self.has_artifact(tags))
    }

    async fn find_by_tags(&self, tags: &Fingerprint) -> Result<Option<Artifact>> {
        self.record(ComputeCall::FindByTags(tags.clone()));
        let state = self.state.lock();
        match state.matching(tags).as_slice() {
            [] => Ok(None),
            [artifact] => Ok(Some((*artifact).clone())),
            many => Err(ChainError::AmbiguousArtifact {
                tags: tags.to_string(),
                count: many.len(),
            }),
        }
    }

    async fn delete_artifacts(&self, tags: &Fingerprint) -> Result<usize> {
        self.record(ComputeCall::DeleteArtifacts(tags.clone()));
        let mut state = self.state.lock();
        let before = state.artifacts.len();
        state.artifacts.retain(|a| !a.tags.contains_all(tags));
        Ok(before - state.artifacts.len())
    }
}

/// A transformation as seen by [`RecordingTransformExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransform {
    /// The request.
    pub request: TransformRequest,
    /// Address of the instance it ran against.
    pub target_address: String,
}

/// A transformation executor that records requests and fails on demand.
#[derive(Debug, Default)]
pub struct RecordingTransformExecutor {
    executions: Mutex<Vec<RecordedTransform>>,
    failing: RwLock<HashSet<String>>,
}

impl RecordingTransformExecutor {
    /// Creates an executor that succeeds for every stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every transformation of `stage`.
    #[must_use]
    pub fn fail_for(self, stage: impl Into<String>) -> Self {
        self.set_failing(stage);
        self
    }

    /// Starts failing transformations of `stage`.
    pub fn set_failing(&self, stage: impl Into<String>) {
        self.failing.write().insert(stage.into());
    }

    /// All recorded transformations.
    #[must_use]
    pub fn executions(&self) -> Vec<RecordedTransform> {
        self.executions.lock().clone()
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn executed_stages(&self) -> Vec<String> {
        self.executions
            .lock()
            .iter()
            .map(|e| e.request.name.clone())
            .collect()
    }

    /// Transform sources in execution order.
    #[must_use]
    pub fn executed_sources(&self) -> Vec<String> {
        self.executions
            .lock()
            .iter()
            .map(|e| e.request.transform_source.clone())
            .collect()
    }
}

#[async_trait]
impl TransformExecutor for RecordingTransformExecutor {
    async fn execute(&self, request: &TransformRequest, target_address: &str) -> Result<()> {
        self.executions.lock().push(RecordedTransform {
            request: request.clone(),
            target_address: target_address.to_string(),
        });

        if self.failing.read().contains(&request.name) {
            return Err(ChainError::transform(&request.name, "transformation reported failure"));
        }
        Ok(())
    }
}
