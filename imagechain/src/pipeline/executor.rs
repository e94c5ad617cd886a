//! Per-task build state machine.
//!
//! `Pending -> Checking -> (Skipped | Building) -> (Done | Failed)`.
//! A started instance is always released before [`BuildExecutor::run`]
//! returns: after a failed transformation the executor stops it, and
//! `store_artifact` stops it itself on both of its outcomes.

use crate::config::ChainConfig;
use crate::core::{Artifact, BuildOutcome, BuildState, Fingerprint, InstanceHandle, Seed};
use crate::errors::{ChainError, Result};
use crate::events::{
    EventSink, NoOpEventSink, STAGE_BUILDING, STAGE_BUILT, STAGE_CHECKING, STAGE_FAILED,
    STAGE_SKIPPED,
};
use crate::pipeline::BuildTask;
use crate::providers::{ComputeProvider, TransformExecutor, TransformRequest};
use crate::stages::{resolve_path, SourceRef};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy)]
enum Step {
    Provision,
    Transform,
    Persist,
}

impl Step {
    /// Attributes a collaborator error to `stage`. Errors already of this
    /// step's kind keep their message.
    fn attribute(self, stage: &str, err: ChainError) -> ChainError {
        match (self, err) {
            (Self::Provision, ChainError::Provision { message, .. }) => {
                ChainError::provision(stage, message)
            }
            (Self::Transform, ChainError::Transform { message, .. }) => {
                ChainError::transform(stage, message)
            }
            (Self::Persist, ChainError::Persist { message, .. }) => {
                ChainError::persist(stage, message)
            }
            (Self::Provision, err) => ChainError::provision(stage, err.to_string()),
            (Self::Transform, err) => ChainError::transform(stage, err.to_string()),
            (Self::Persist, err) => ChainError::persist(stage, err.to_string()),
        }
    }
}

/// Runs the build of a single task against the collaborators.
pub struct BuildExecutor {
    compute: Arc<dyn ComputeProvider>,
    transform: Arc<dyn TransformExecutor>,
    base_artifact: Option<String>,
    root_path: PathBuf,
    events: Arc<dyn EventSink>,
    states: Mutex<IndexMap<String, BuildState>>,
}

impl std::fmt::Debug for BuildExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildExecutor")
            .field("base_artifact", &self.base_artifact)
            .field("root_path", &self.root_path)
            .field("states", &*self.states.lock())
            .finish_non_exhaustive()
    }
}

impl BuildExecutor {
    /// Creates an executor with no base artifact, rooted at `/`.
    #[must_use]
    pub fn new(compute: Arc<dyn ComputeProvider>, transform: Arc<dyn TransformExecutor>) -> Self {
        Self {
            compute,
            transform,
            base_artifact: None,
            root_path: PathBuf::from("/"),
            events: Arc::new(NoOpEventSink),
            states: Mutex::new(IndexMap::new()),
        }
    }

    /// Creates an executor from a configuration.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the compute provider or the transformation
    /// executor is missing, `Io` if the root path cannot be determined.
    pub fn from_config(config: &ChainConfig) -> Result<Self> {
        Ok(Self::new(config.compute_provider()?, config.transform_executor()?)
            .with_base_artifact(config.base_artifact().map(str::to_string))
            .with_root_path(config.root_path()?)
            .with_event_sink(config.event_sink()))
    }

    /// Sets the artifact the root stage starts from.
    #[must_use]
    pub fn with_base_artifact(mut self, base_artifact: Option<String>) -> Self {
        self.base_artifact = base_artifact;
        self
    }

    /// Sets the directory transform sources are resolved against.
    #[must_use]
    pub fn with_root_path(mut self, root_path: impl Into<PathBuf>) -> Self {
        self.root_path = root_path.into();
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Current state of a task; `Pending` if it never ran.
    #[must_use]
    pub fn state_of(&self, task_id: &str) -> BuildState {
        self.states.lock().get(task_id).copied().unwrap_or_default()
    }

    /// Forgets all recorded states.
    pub fn reset_states(&self) {
        self.states.lock().clear();
    }

    /// Runs one task to `Done` or `Failed`.
    ///
    /// # Errors
    ///
    /// Propagates the first failure of the task's build; the instance was
    /// released before the error is returned.
    pub async fn run(&self, task: &BuildTask) -> Result<BuildOutcome> {
        let span = info_span!("build_task", stage = %task.name(), task_id = %task.task_id());

        async {
            self.transition(task, BuildState::Checking);
            self.events.try_emit(STAGE_CHECKING, Some(payload(task, None)));

            match self.check_and_build(task).await {
                Ok(outcome) => {
                    self.transition(task, BuildState::Done);
                    Ok(outcome)
                }
                Err(err) => {
                    self.transition(task, BuildState::Failed);
                    error!(code = err.code(), error = %err, "Stage build failed");
                    self.events
                        .emit(STAGE_FAILED, Some(payload(task, Some(&err))))
                        .await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn transition(&self, task: &BuildTask, state: BuildState) {
        debug!(state = %state, "Task state changed");
        self.states.lock().insert(task.task_id().to_string(), state);
    }

    async fn check_and_build(&self, task: &BuildTask) -> Result<BuildOutcome> {
        let tags = task.fingerprint();

        if self.compute.exists(tags).await? {
            self.transition(task, BuildState::Skipped);
            for (key, value) in tags.iter() {
                info!(tag = %key, value = %value, "Artifact tag");
            }
            info!(image_type = ?tags.image_type(), "Artifact already up to date");
            self.events.emit(STAGE_SKIPPED, Some(payload(task, None))).await;
            return Ok(BuildOutcome::Skipped);
        }

        self.transition(task, BuildState::Building);
        self.events.emit(STAGE_BUILDING, Some(payload(task, None))).await;

        let seed = self.seed_for(task).await?;
        let artifact = self.build(task, &seed).await?;

        self.events.emit(STAGE_BUILT, Some(payload(task, None))).await;
        Ok(BuildOutcome::Built { artifact })
    }

    async fn seed_for(&self, task: &BuildTask) -> Result<Seed> {
        let Some(upstream) = task.upstream_fingerprint() else {
            return self.base_artifact.clone().map(Seed::Id).ok_or_else(|| {
                ChainError::configuration(format!(
                    "no base_artifact configured for root stage '{}'",
                    task.name()
                ))
            });
        };

        match self.compute.find_by_tags(upstream).await? {
            Some(artifact) => {
                debug!(artifact = %artifact.id, "Found upstream artifact");
                Ok(Seed::Id(artifact.id))
            }
            None => Err(ChainError::ArtifactNotFound {
                tags: upstream.to_string(),
            }),
        }
    }

    async fn build(&self, task: &BuildTask, seed: &Seed) -> Result<Option<Artifact>> {
        let stage = task.name();
        let tags = task.fingerprint();

        info!(seed = %seed, "Starting instance");
        let instance = self
            .compute
            .start_instance(seed)
            .await
            .map_err(|e| Step::Provision.attribute(stage, e))?;
        info!(instance = %instance, "Instance started");

        self.transform_on(task, &instance).await?;

        info!(instance = %instance.id, "Storing artifact");
        self.compute
            .store_artifact(&instance, tags)
            .await
            .map_err(|e| Step::Persist.attribute(stage, e))?;
        info!("Artifact stored");

        Ok(self.stored_artifact(tags).await)
    }

    async fn transform_on(&self, task: &BuildTask, instance: &InstanceHandle) -> Result<()> {
        let request = TransformRequest {
            name: task.name().to_string(),
            transform_source: resolve_path(
                &SourceRef::from(task.stage().transform_source()),
                &self.root_path,
            ),
            tags: task.fingerprint().clone(),
            version: task.stage().version().to_string(),
        };

        info!(transform_source = %request.transform_source, "Executing transformation");
        if let Err(err) = self.transform.execute(&request, &instance.address).await {
            warn!(instance = %instance.id, "Transformation failed, stopping instance");
            self.compute.stop_instance(instance).await;
            return Err(Step::Transform.attribute(task.name(), err));
        }
        info!("Transformation done");
        Ok(())
    }

    async fn stored_artifact(&self, tags: &Fingerprint) -> Option<Artifact> {
        match self.compute.find_by_tags(tags).await {
            Ok(artifact) => artifact,
            Err(err) => {
                warn!(error = %err, "Stored artifact could not be looked up");
                None
            }
        }
    }
}

fn payload(task: &BuildTask, err: Option<&ChainError>) -> Value {
    let mut data = json!({
        "stage": task.name(),
        "task_id": task.task_id(),
        "fingerprint": task.fingerprint(),
    });
    if let (Some(err), Value::Object(map)) = (err, &mut data) {
        map.insert("error".to_string(), Value::String(err.to_string()));
        map.insert("code".to_string(), Value::String(err.code().to_string()));
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::TaskGraph;
    use crate::providers::{MockComputeProvider, MockTransformExecutor};
    use crate::stages::{normalize, ResolvedStage};
    use mockall::predicate::eq;

    fn graph() -> TaskGraph {
        let stages = normalize(["application", "base"])
            .unwrap()
            .into_iter()
            .zip(["1", "3"])
            .map(|(spec, version)| ResolvedStage::new(spec, version))
            .collect();
        TaskGraph::build(stages).unwrap()
    }

    fn ok_transform() -> MockTransformExecutor {
        let mut transform = MockTransformExecutor::new();
        transform.expect_execute().returning(|_, _| Ok(()));
        transform
    }

    #[tokio::test]
    async fn test_existing_artifact_is_skipped() {
        let graph = graph();
        let mut compute = MockComputeProvider::new();
        compute.expect_exists().times(1).returning(|_| Ok(true));
        compute.expect_start_instance().never();
        let mut transform = MockTransformExecutor::new();
        transform.expect_execute().never();

        let events = Arc::new(CollectingEventSink::new());
        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(transform))
            .with_event_sink(events.clone());
        let task = graph.get("base").unwrap();

        let outcome = executor.run(task).await.unwrap();

        assert_eq!(outcome, BuildOutcome::Skipped);
        assert_eq!(executor.state_of("base"), BuildState::Done);
        assert_eq!(events.event_types(), vec![STAGE_CHECKING, STAGE_SKIPPED]);
    }

    #[derive(Default)]
    struct NonBlockingSink {
        received: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl EventSink for NonBlockingSink {
        async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

        fn try_emit(&self, event_type: &str, _data: Option<Value>) {
            self.received.lock().push(event_type.to_string());
        }
    }

    #[tokio::test]
    async fn test_checking_is_emitted_without_blocking() {
        let graph = graph();
        let mut compute = MockComputeProvider::new();
        compute.expect_exists().returning(|_| Ok(true));

        let sink = Arc::new(NonBlockingSink::default());
        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(ok_transform()))
            .with_event_sink(sink.clone());

        executor.run(graph.get("base").unwrap()).await.unwrap();

        assert_eq!(*sink.received.lock(), vec![STAGE_CHECKING.to_string()]);
    }

    #[tokio::test]
    async fn test_root_stage_without_base_artifact() {
        let graph = graph();
        let mut compute = MockComputeProvider::new();
        compute.expect_exists().returning(|_| Ok(false));
        compute.expect_start_instance().never();

        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(ok_transform()));
        let err = executor.run(graph.get("base").unwrap()).await.unwrap_err();

        assert!(matches!(err, ChainError::Configuration { .. }));
        assert_eq!(executor.state_of("base"), BuildState::Failed);
    }

    #[tokio::test]
    async fn test_provision_failure_is_attributed() {
        let graph = graph();
        let mut compute = MockComputeProvider::new();
        compute.expect_exists().returning(|_| Ok(false));
        compute
            .expect_start_instance()
            .with(eq(Seed::Id("ami-base".to_string())))
            .returning(|_| Err(ChainError::configuration("quota exceeded")));
        compute.expect_stop_instance().never();

        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(ok_transform()))
            .with_base_artifact(Some("ami-base".to_string()));
        let err = executor.run(graph.get("base").unwrap()).await.unwrap_err();

        assert!(matches!(err, ChainError::Provision { ref stage, .. } if stage == "base"));
    }

    #[tokio::test]
    async fn test_transform_failure_stops_instance() {
        let graph = graph();
        let mut compute = MockComputeProvider::new();
        compute.expect_exists().returning(|_| Ok(false));
        compute
            .expect_start_instance()
            .returning(|_| Ok(InstanceHandle::new("i-1", "10.0.0.1")));
        compute
            .expect_stop_instance()
            .with(eq(InstanceHandle::new("i-1", "10.0.0.1")))
            .times(1)
            .returning(|_| ());
        compute.expect_store_artifact().never();

        let mut transform = MockTransformExecutor::new();
        transform
            .expect_execute()
            .withf(|request, address| {
                request.name == "base"
                    && request.transform_source == "/srv/base.rb"
                    && address == "10.0.0.1"
            })
            .returning(|request, _| Err(ChainError::transform(&request.name, "exit 1")));

        let events = Arc::new(CollectingEventSink::new());
        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(transform))
            .with_base_artifact(Some("ami-base".to_string()))
            .with_root_path("/srv")
            .with_event_sink(events.clone());
        let err = executor.run(graph.get("base").unwrap()).await.unwrap_err();

        assert!(matches!(err, ChainError::Transform { .. }));
        let failed = events.events_of_type(STAGE_FAILED);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1.as_ref().unwrap()["code"], "CHAIN-TRANSFORM");
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_stop_twice() {
        let graph = graph();
        let mut compute = MockComputeProvider::new();
        compute.expect_exists().returning(|_| Ok(false));
        compute
            .expect_start_instance()
            .returning(|_| Ok(InstanceHandle::new("i-1", "10.0.0.1")));
        compute
            .expect_store_artifact()
            .times(1)
            .returning(|_, _| Err(ChainError::configuration("snapshot failed")));
        compute.expect_stop_instance().never();

        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(ok_transform()))
            .with_base_artifact(Some("ami-base".to_string()));
        let err = executor.run(graph.get("base").unwrap()).await.unwrap_err();

        assert!(matches!(err, ChainError::Persist { ref stage, .. } if stage == "base"));
    }

    #[tokio::test]
    async fn test_ambiguous_upstream_artifact() {
        let graph = graph();
        let mut compute = MockComputeProvider::new();
        compute.expect_exists().returning(|_| Ok(false));
        compute.expect_find_by_tags().returning(|tags| {
            Err(ChainError::AmbiguousArtifact {
                tags: tags.to_string(),
                count: 2,
            })
        });
        compute.expect_start_instance().never();

        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(ok_transform()));
        let err = executor
            .run(graph.get("application").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::AmbiguousArtifact { count: 2, .. }));
    }

    #[tokio::test]
    async fn test_missing_upstream_artifact() {
        let graph = graph();
        let mut compute = MockComputeProvider::new();
        compute.expect_exists().returning(|_| Ok(false));
        compute.expect_find_by_tags().returning(|_| Ok(None));

        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(ok_transform()));
        let err = executor
            .run(graph.get("application").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn test_builds_from_upstream_artifact() {
        let graph = graph();
        let upstream = graph.get("base").unwrap().fingerprint().clone();
        let own = graph.get("application").unwrap().fingerprint().clone();

        let mut compute = MockComputeProvider::new();
        compute.expect_exists().returning(|_| Ok(false));
        compute
            .expect_find_by_tags()
            .with(eq(upstream.clone()))
            .returning(move |tags| Ok(Some(Artifact::new("img-base", tags.clone()))));
        compute
            .expect_start_instance()
            .with(eq(Seed::Id("img-base".to_string())))
            .returning(|_| Ok(InstanceHandle::new("i-2", "10.0.0.2")));
        compute
            .expect_store_artifact()
            .with(eq(InstanceHandle::new("i-2", "10.0.0.2")), eq(own.clone()))
            .returning(|_, _| Ok(()));
        compute
            .expect_find_by_tags()
            .with(eq(own.clone()))
            .returning(|tags| Ok(Some(Artifact::new("img-app", tags.clone()))));

        let executor = BuildExecutor::new(Arc::new(compute), Arc::new(ok_transform()));
        let outcome = executor.run(graph.get("application").unwrap()).await.unwrap();

        let BuildOutcome::Built { artifact: Some(artifact) } = outcome else {
            panic!("expected a built artifact");
        };
        assert_eq!(artifact.id, "img-app");
        assert_eq!(executor.state_of("application"), BuildState::Done);
    }
}
