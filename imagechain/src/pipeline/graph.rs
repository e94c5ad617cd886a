//! Task graph of a chain.
//!
//! Every stage gets one task. The task of stage *i* depends on the tasks of
//! all stages declared after it, so invoking the first task builds the whole
//! chain from the base upwards.

use crate::core::{build_fingerprint, Fingerprint};
use crate::errors::{ChainError, Result};
use crate::stages::ResolvedStage;
use indexmap::IndexMap;
use std::collections::HashSet;

/// One stage's unit of work.
#[derive(Debug, Clone)]
pub struct BuildTask {
    stage: ResolvedStage,
    dependencies: Vec<String>,
    fingerprint: Fingerprint,
    upstream_fingerprint: Option<Fingerprint>,
}

impl BuildTask {
    /// The task identifier.
    #[must_use]
    pub fn task_id(&self) -> &str {
        self.stage.task_id()
    }

    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.stage.name()
    }

    /// The stage this task builds.
    #[must_use]
    pub fn stage(&self) -> &ResolvedStage {
        &self.stage
    }

    /// Task ids this task depends on, nearest upstream stage first.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Tags of the artifact this task produces.
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Tags of the immediate upstream artifact; `None` for the root stage.
    #[must_use]
    pub fn upstream_fingerprint(&self) -> Option<&Fingerprint> {
        self.upstream_fingerprint.as_ref()
    }

    /// Returns true if the stage starts from the configured base artifact.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.upstream_fingerprint.is_none()
    }

    /// Human-readable description, if one was declared.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.stage.description()
    }
}

/// All tasks of a chain, keyed by task id in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: IndexMap<String, BuildTask>,
}

impl TaskGraph {
    /// Builds one task per stage.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if two stages share a task id.
    pub fn build(stages: Vec<ResolvedStage>) -> Result<Self> {
        let mut tasks = IndexMap::with_capacity(stages.len());

        for (index, stage) in stages.iter().enumerate() {
            let upstream = &stages[index + 1..];
            let fingerprint = build_fingerprint(stage, upstream);
            let upstream_fingerprint = upstream
                .split_first()
                .map(|(parent, rest)| build_fingerprint(parent, rest));
            let dependencies = upstream.iter().map(|s| s.task_id().to_string()).collect();

            let task = BuildTask {
                stage: stage.clone(),
                dependencies,
                fingerprint,
                upstream_fingerprint,
            };

            if tasks.insert(stage.task_id().to_string(), task).is_some() {
                return Err(ChainError::invalid_input(format!(
                    "task id '{}' is declared more than once",
                    stage.task_id()
                )));
            }
        }

        Ok(Self { tasks })
    }

    /// Returns the task with the given id.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&BuildTask> {
        self.tasks.get(task_id)
    }

    /// Task ids in declaration order.
    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Iterates over tasks in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &BuildTask> {
        self.tasks.values()
    }

    /// Returns the number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the graph has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns the tasks to run for `target`, dependencies first.
    ///
    /// Each task appears once even when several tasks depend on it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `target` is not a task of this graph.
    pub fn execution_order(&self, target: &str) -> Result<Vec<&BuildTask>> {
        if !self.tasks.contains_key(target) {
            return Err(ChainError::invalid_input(format!("unknown task '{target}'")));
        }

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.visit(target, &mut visited, &mut order);
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        task_id: &str,
        visited: &mut HashSet<&'a str>,
        order: &mut Vec<&'a BuildTask>,
    ) {
        let Some((id, task)) = self.tasks.get_key_value(task_id) else {
            return;
        };
        if !visited.insert(id.as_str()) {
            return;
        }

        // Deepest dependency first, so the base is built before anything on top of it.
        for dependency in task.dependencies.iter().rev() {
            self.visit(dependency, visited, order);
        }

        order.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{normalize, PartialStage, RawStage};
    use pretty_assertions::assert_eq;

    fn graph(raw: Vec<RawStage>, versions: &[&str]) -> Result<TaskGraph> {
        let stages = normalize(raw)?
            .into_iter()
            .zip(versions)
            .map(|(spec, version)| ResolvedStage::new(spec, *version))
            .collect();
        TaskGraph::build(stages)
    }

    fn chain() -> TaskGraph {
        graph(
            vec!["application".into(), "middle_ware".into(), "base".into()],
            &["1", "2", "3"],
        )
        .unwrap()
    }

    #[test]
    fn test_dependencies_follow_declaration_order() {
        let graph = chain();

        assert_eq!(
            graph.get("application").unwrap().dependencies(),
            ["middle_ware", "base"]
        );
        assert_eq!(graph.get("middle_ware").unwrap().dependencies(), ["base"]);
        assert!(graph.get("base").unwrap().dependencies().is_empty());
        assert_eq!(
            graph.task_ids().collect::<Vec<_>>(),
            vec!["application", "middle_ware", "base"]
        );
    }

    #[test]
    fn test_fingerprints() {
        let graph = chain();
        let application = graph.get("application").unwrap();

        assert_eq!(
            application.fingerprint(),
            &Fingerprint::from_iter([
                ("image_type", "application"),
                ("application", "1"),
                ("middle_ware", "2"),
                ("base", "3"),
            ])
        );
        assert_eq!(
            application.upstream_fingerprint(),
            Some(graph.get("middle_ware").unwrap().fingerprint())
        );
        assert!(graph.get("base").unwrap().is_root());
    }

    #[test]
    fn test_fingerprint_monotonicity() {
        let graph = chain();
        let tasks: Vec<_> = graph.iter().collect();

        for pair in tasks.windows(2) {
            let (upper, lower) = (pair[0].fingerprint(), pair[1].fingerprint());
            assert_eq!(upper.len(), lower.len() + 1);
            assert_eq!(upper.get(pair[0].name()), Some(pair[0].stage().version()));
            for (key, value) in lower.iter().filter(|(key, _)| *key != "image_type") {
                assert_eq!(upper.get(key), Some(value));
            }
        }
    }

    #[test]
    fn test_execution_order_is_memoized() {
        let graph = chain();
        let order: Vec<_> = graph
            .execution_order("application")
            .unwrap()
            .iter()
            .map(|t| t.task_id())
            .collect();

        assert_eq!(order, vec!["base", "middle_ware", "application"]);
    }

    #[test]
    fn test_execution_order_of_inner_task() {
        let graph = chain();
        let order: Vec<_> = graph
            .execution_order("middle_ware")
            .unwrap()
            .iter()
            .map(|t| t.task_id())
            .collect();

        assert_eq!(order, vec!["base", "middle_ware"]);
    }

    #[test]
    fn test_unknown_target() {
        let err = chain().execution_order("nope").unwrap_err();
        assert!(matches!(err, ChainError::InvalidInput { .. }));
    }

    #[test]
    fn test_custom_task_id_and_description() {
        let graph = graph(
            vec![
                PartialStage::new("application")
                    .with_task_id("build_app")
                    .with_description("Build the application image")
                    .into(),
                "base".into(),
            ],
            &["1", "3"],
        )
        .unwrap();

        let task = graph.get("build_app").unwrap();
        assert_eq!(task.name(), "application");
        assert_eq!(task.description(), Some("Build the application image"));
        assert_eq!(task.dependencies(), ["base"]);
        assert_eq!(graph.get("base").unwrap().description(), None);
    }

    #[test]
    fn test_duplicate_task_id_rejected() {
        let stages = vec![
            ResolvedStage::new(crate::stages::StageSpec::named("a"), "1"),
            ResolvedStage::new(crate::stages::StageSpec::named("a"), "2"),
        ];

        let err = TaskGraph::build(stages).unwrap_err();
        assert!(matches!(err, ChainError::InvalidInput { .. }));
    }
}
