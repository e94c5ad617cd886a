//! Orchestration entry point.

use super::{BuildExecutor, BuildTask, TaskGraph};
use crate::config::{ChainConfig, ChainOptions};
use crate::core::{Artifact, BuildOutcome, BuildState, Fingerprint};
use crate::errors::{ChainError, Result};
use crate::events::{EventSink, CHAIN_COMPLETED, CHAIN_FAILED, CHAIN_STARTED};
use crate::stages::{normalize_with_extension, resolve_versions, RawStage};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// One executed task in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRun {
    /// The task id.
    pub task_id: String,
    /// The stage name.
    pub stage: String,
    /// What the task did.
    pub outcome: BuildOutcome,
}

/// Result of [`ImageChain::invoke`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Identifier of this run.
    pub run_id: Uuid,
    /// The invoked task.
    pub target: String,
    /// Executed tasks in execution order.
    pub tasks: Vec<TaskRun>,
}

impl RunReport {
    fn new(target: &str) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            target: target.to_string(),
            tasks: Vec::new(),
        }
    }

    /// Number of tasks that stored a new artifact.
    #[must_use]
    pub fn built(&self) -> usize {
        self.tasks.iter().filter(|t| t.outcome.is_built()).count()
    }

    /// Number of tasks whose artifact already existed.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.tasks.len() - self.built()
    }

    /// Task ids in execution order.
    #[must_use]
    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.task_id.as_str()).collect()
    }

    /// Artifacts stored during the run, where the provider reported them.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.tasks.iter().filter_map(|t| match &t.outcome {
            BuildOutcome::Built { artifact } => artifact.as_ref(),
            BuildOutcome::Skipped => None,
        })
    }
}

/// A defined chain of stages, ready to be invoked.
pub struct ImageChain {
    graph: TaskGraph,
    executor: BuildExecutor,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ImageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageChain")
            .field("graph", &self.graph)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ImageChain {
    /// Defines a chain from stage declarations, first stage on top.
    ///
    /// `options` override `config` for this chain only. Stage declarations
    /// are validated before any collaborator is called; versions are then
    /// resolved once, so the fingerprints are fixed for the chain's lifetime.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for bad declarations, `Configuration` for missing
    /// collaborators, `VersionLookup` if a version cannot be resolved.
    pub async fn define<I, S>(
        stages: I,
        config: &ChainConfig,
        options: &ChainOptions,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<RawStage>,
    {
        let config = config.with_overrides(options);
        let specs = normalize_with_extension(stages, config.source_extension())?;

        let executor = BuildExecutor::from_config(&config)?;
        let root = config.root_path()?;
        let versions = config.version_provider()?;
        let resolved = resolve_versions(specs, versions.as_ref(), &root).await?;
        let graph = TaskGraph::build(resolved)?;

        info!(
            tasks = graph.len(),
            root_path = %root.display(),
            "Defined image chain"
        );

        Ok(Self {
            graph,
            executor,
            events: config.event_sink(),
        })
    }

    /// Defines a chain from JSON stage declarations (names or objects).
    ///
    /// # Errors
    ///
    /// `InvalidInput` naming the first unrecognized stage key, before any
    /// collaborator is called; otherwise see [`Self::define`].
    pub async fn define_from_json(
        stages: Vec<Value>,
        config: &ChainConfig,
        options: &ChainOptions,
    ) -> Result<Self> {
        let raw = stages
            .into_iter()
            .map(RawStage::try_from)
            .collect::<Result<Vec<_>>>()?;
        Self::define(raw, config, options).await
    }

    /// The task with the given id.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&BuildTask> {
        self.graph.get(task_id)
    }

    /// Task ids in declaration order.
    #[must_use]
    pub fn task_ids(&self) -> Vec<&str> {
        self.graph.task_ids().collect()
    }

    /// The task that builds the whole chain.
    #[must_use]
    pub fn entry_task(&self) -> Option<&str> {
        self.graph.task_ids().next()
    }

    /// Task ids `task_id` depends on.
    #[must_use]
    pub fn prerequisites(&self, task_id: &str) -> Option<&[String]> {
        self.graph.get(task_id).map(BuildTask::dependencies)
    }

    /// Fingerprint of the artifact `task_id` produces.
    #[must_use]
    pub fn fingerprint(&self, task_id: &str) -> Option<&Fingerprint> {
        self.graph.get(task_id).map(BuildTask::fingerprint)
    }

    /// State of `task_id` in the latest run.
    #[must_use]
    pub fn state_of(&self, task_id: &str) -> BuildState {
        self.executor.state_of(task_id)
    }

    /// The underlying task graph.
    #[must_use]
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Builds `task_id` and everything it depends on, base first.
    ///
    /// Each task runs at most once per call. The first failure aborts the run;
    /// tasks depending on the failed one are not started.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an unknown task id, otherwise the failing task's error.
    pub async fn invoke(&self, task_id: &str) -> Result<RunReport> {
        let order = self.graph.execution_order(task_id)?;
        let mut report = RunReport::new(task_id);
        let span = info_span!("chain_run", run_id = %report.run_id, target = %task_id);

        async {
            self.executor.reset_states();
            self.events
                .emit(
                    CHAIN_STARTED,
                    Some(json!({"target": task_id, "tasks": order.len()})),
                )
                .await;

            for task in order {
                match self.executor.run(task).await {
                    Ok(outcome) => report.tasks.push(TaskRun {
                        task_id: task.task_id().to_string(),
                        stage: task.name().to_string(),
                        outcome,
                    }),
                    Err(err) => {
                        self.emit_failed(task_id, task, &err).await;
                        return Err(err);
                    }
                }
            }

            info!(built = report.built(), skipped = report.skipped(), "Chain run finished");
            self.events
                .emit(
                    CHAIN_COMPLETED,
                    Some(json!({
                        "target": task_id,
                        "built": report.built(),
                        "skipped": report.skipped(),
                    })),
                )
                .await;
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Invokes the entry task, building the whole chain.
    ///
    /// # Errors
    ///
    /// See [`Self::invoke`].
    pub async fn invoke_all(&self) -> Result<RunReport> {
        let entry = self
            .entry_task()
            .ok_or_else(|| ChainError::invalid_input("chain has no tasks"))?
            .to_string();
        self.invoke(&entry).await
    }

    async fn emit_failed(&self, target: &str, task: &BuildTask, err: &ChainError) {
        self.events
            .emit(
                CHAIN_FAILED,
                Some(json!({
                    "target": target,
                    "stage": task.name(),
                    "task_id": task.task_id(),
                    "error": err.to_string(),
                    "code": err.code(),
                })),
            )
            .await;
    }
}
