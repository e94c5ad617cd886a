//! End-to-end chain scenarios against the in-memory collaborators.

#[cfg(test)]
mod tests {
    use crate::config::{ChainConfig, ChainOptions};
    use crate::core::{BuildOutcome, BuildState, Fingerprint};
    use crate::errors::ChainError;
    use crate::events::{CHAIN_COMPLETED, CHAIN_FAILED, CHAIN_STARTED, STAGE_BUILT, STAGE_SKIPPED};
    use crate::pipeline::ImageChain;
    use crate::stages::{PartialStage, RawStage};
    use crate::testing::{
        ChainFixture, ComputeCall, InMemoryCompute, RecordingTransformExecutor,
        TableVersionProvider,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn tags(pairs: &[(&str, &str)]) -> Fingerprint {
        pairs.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_first_run_builds_every_stage() {
        let fixture = ChainFixture::new();

        let report = fixture.run().await.unwrap();

        assert_eq!(report.built(), 3);
        assert_eq!(fixture.compute.artifact_count(), 3);
        assert!(fixture.compute.has_artifact(&tags(&[
            ("image_type", "application"),
            ("application", "1"),
            ("middle_ware", "2"),
            ("base", "3"),
        ])));
        assert!(fixture.compute.has_artifact(&tags(&[
            ("image_type", "middle_ware"),
            ("middle_ware", "2"),
            ("base", "3"),
        ])));
        assert!(fixture
            .compute
            .has_artifact(&tags(&[("image_type", "base"), ("base", "3")])));
        assert!(fixture.compute.running_instances().is_empty());
    }

    #[tokio::test]
    async fn test_stages_execute_base_first() {
        let fixture = ChainFixture::new();

        let report = fixture.run().await.unwrap();

        assert_eq!(report.task_ids(), vec!["base", "middle_ware", "application"]);
        assert_eq!(
            fixture.transform.executed_sources(),
            vec!["/base.rb", "/middle_ware.rb", "/application.rb"]
        );
    }

    #[tokio::test]
    async fn test_root_stage_starts_from_base_artifact() {
        let fixture = ChainFixture::new();
        fixture.run().await.unwrap();

        let first_start = fixture
            .compute
            .calls()
            .into_iter()
            .find_map(|call| match call {
                ComputeCall::StartInstance(seed) => Some(seed),
                _ => None,
            })
            .unwrap();
        assert_eq!(first_start.to_string(), format!("id {}", ChainFixture::BASE_ARTIFACT));
    }

    #[tokio::test]
    async fn test_second_run_builds_nothing() {
        let fixture = ChainFixture::new();
        fixture.run().await.unwrap();

        let report = fixture.run().await.unwrap();

        assert_eq!(report.built(), 0);
        assert_eq!(report.skipped(), 3);
        assert!(report.tasks.iter().all(|t| t.outcome == BuildOutcome::Skipped));
        assert_eq!(fixture.compute.artifact_count(), 3);
        assert_eq!(fixture.transform.executions().len(), 3);
    }

    #[tokio::test]
    async fn test_middle_stage_bump_rebuilds_dependents_only() {
        let fixture = ChainFixture::new();
        fixture.run().await.unwrap();

        fixture.set_version("/middle_ware.rb", "4");
        let report = fixture.run().await.unwrap();

        assert_eq!(report.built(), 2);
        assert_eq!(report.tasks[0].task_id, "base");
        assert_eq!(report.tasks[0].outcome, BuildOutcome::Skipped);
        assert_eq!(fixture.compute.artifact_count(), 5);
        assert!(fixture.compute.has_artifact(&tags(&[
            ("image_type", "application"),
            ("application", "1"),
            ("middle_ware", "4"),
            ("base", "3"),
        ])));
        assert!(fixture.compute.running_instances().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transformation_leaves_nothing_behind() {
        let fixture = ChainFixture::failing("middle_ware");

        let err = fixture.run().await.unwrap_err();

        assert!(matches!(err, ChainError::Transform { ref stage, .. } if stage == "middle_ware"));
        assert!(fixture.compute.running_instances().is_empty());
        assert!(!fixture.compute.has_artifact(&tags(&[
            ("image_type", "middle_ware"),
            ("middle_ware", "2"),
            ("base", "3"),
        ])));
        // The base was built, the application never started.
        assert_eq!(fixture.compute.artifact_count(), 1);
        assert_eq!(fixture.transform.executed_stages(), vec!["base", "middle_ware"]);
    }

    #[tokio::test]
    async fn test_failure_states_and_events() {
        let fixture = ChainFixture::failing("middle_ware");
        let chain = fixture.define().await.unwrap();

        assert!(chain.invoke("application").await.is_err());

        assert_eq!(chain.state_of("base"), BuildState::Done);
        assert_eq!(chain.state_of("middle_ware"), BuildState::Failed);
        assert_eq!(chain.state_of("application"), BuildState::Pending);

        let chain_events = fixture.events.events_of_type("chain.");
        assert_eq!(chain_events[0].0, CHAIN_STARTED);
        assert_eq!(chain_events[1].0, CHAIN_FAILED);
        assert_eq!(chain_events[1].1.as_ref().unwrap()["code"], "CHAIN-TRANSFORM");
    }

    #[tokio::test]
    async fn test_events_of_a_skipping_run() {
        let fixture = ChainFixture::new();
        fixture.run().await.unwrap();
        fixture.events.clear();

        fixture.run().await.unwrap();

        assert_eq!(fixture.events.events_of_type(STAGE_SKIPPED).len(), 3);
        assert!(fixture.events.events_of_type(STAGE_BUILT).is_empty());
        let (last, data) = fixture.events.events().pop().unwrap();
        assert_eq!(last, CHAIN_COMPLETED);
        assert_eq!(data.unwrap()["skipped"], 3);
    }

    #[tokio::test]
    async fn test_unrecognized_stage_key_fails_before_collaborators() {
        let fixture = ChainFixture::new();

        let err = ImageChain::define_from_json(
            vec![json!("application"), json!({"name": "base", "foobar": "x"})],
            &fixture.config,
            &ChainOptions::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChainError::InvalidInput { .. }));
        assert!(err.to_string().contains("foobar"));
        assert!(fixture.versions.lookups().is_empty());
        assert!(fixture.compute.calls().is_empty());
        assert!(fixture.transform.executions().is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_nameless_declarations() {
        let fixture = ChainFixture::new();

        let err = ImageChain::define(Vec::<&str>::new(), &fixture.config, &ChainOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidInput { .. }));

        let err = ImageChain::define_from_json(
            vec![json!({"task_id": "x"})],
            &fixture.config,
            &ChainOptions::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_stage_rejected() {
        let fixture = ChainFixture::new();
        let err = ImageChain::define(["base", "base"], &fixture.config, &ChainOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::InvalidInput { .. }));
        assert!(fixture.versions.lookups().is_empty());
    }

    #[tokio::test]
    async fn test_introspection() {
        let fixture = ChainFixture::new();
        let chain = ImageChain::define(
            vec![
                RawStage::from(
                    PartialStage::new("application").with_description("Application server image"),
                ),
                "middle_ware".into(),
                "base".into(),
            ],
            &fixture.config,
            &ChainOptions::new(),
        )
        .await
        .unwrap();

        assert_eq!(chain.entry_task(), Some("application"));
        assert_eq!(
            chain.task("application").unwrap().description(),
            Some("Application server image")
        );
        assert_eq!(chain.task("base").unwrap().description(), None);
        assert_eq!(
            chain.prerequisites("application").unwrap(),
            ["middle_ware", "base"]
        );
        assert_eq!(
            chain.fingerprint("middle_ware").unwrap(),
            &tags(&[("image_type", "middle_ware"), ("middle_ware", "2"), ("base", "3")])
        );
        assert!(chain.task("nope").is_none());
    }

    #[tokio::test]
    async fn test_first_stage_uses_tree_version() {
        let fixture = ChainFixture::new();
        fixture.set_version("*", "7");

        let chain = fixture.define().await.unwrap();

        assert_eq!(
            chain.fingerprint("application").unwrap().get("application"),
            Some("7")
        );
    }

    #[tokio::test]
    async fn test_explicit_sources() {
        let fixture = ChainFixture::new();
        fixture.set_version("/recipes/app.rb", "9");

        let chain = ImageChain::define(
            vec![
                RawStage::from(
                    PartialStage::new("application")
                        .with_version_source("recipes/app.rb")
                        .with_transform_source("deploy/app.rb"),
                ),
                "base".into(),
            ],
            &fixture.config,
            &ChainOptions::new(),
        )
        .await
        .unwrap();
        chain.invoke("application").await.unwrap();

        assert_eq!(
            chain.fingerprint("application").unwrap().get("application"),
            Some("9")
        );
        assert_eq!(
            fixture.transform.executed_sources(),
            vec!["/base.rb", "/deploy/app.rb"]
        );
    }

    #[tokio::test]
    async fn test_unknown_version_reference() {
        let fixture = ChainFixture::new();
        let err = ImageChain::define(
            ["application", "other"],
            &fixture.config,
            &ChainOptions::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ChainError::VersionLookup { ref reference, .. } if reference == "/other.rb"
        ));
        assert!(fixture.compute.calls().is_empty());
    }

    #[tokio::test]
    async fn test_options_override_configuration() {
        let fixture = ChainFixture::new();
        let other_compute = Arc::new(InMemoryCompute::new());

        let chain = ImageChain::define(
            ChainFixture::STAGES,
            &fixture.config,
            &ChainOptions::new()
                .with_compute_provider(other_compute.clone())
                .with_base_artifact("ami-other"),
        )
        .await
        .unwrap();
        chain.invoke("application").await.unwrap();

        assert_eq!(other_compute.artifact_count(), 3);
        assert_eq!(fixture.compute.artifact_count(), 0);
        // The shared configuration is untouched.
        assert_eq!(fixture.config.base_artifact(), Some(ChainFixture::BASE_ARTIFACT));
    }

    #[tokio::test]
    async fn test_missing_base_artifact_fails_root_stage() {
        let fixture = ChainFixture::new();
        let mut config = ChainConfig::new();
        config.set_defaults(
            &ChainOptions::new()
                .with_version_provider(fixture.versions.clone())
                .with_compute_provider(fixture.compute.clone())
                .with_transform_executor(fixture.transform.clone())
                .with_root_path("/"),
        );

        let chain = ImageChain::define(ChainFixture::STAGES, &config, &ChainOptions::new())
            .await
            .unwrap();
        let err = chain.invoke("application").await.unwrap_err();

        assert!(matches!(err, ChainError::Configuration { .. }));
        assert!(!fixture.compute.call_names().contains(&"start_instance"));
    }

    #[tokio::test]
    async fn test_missing_compute_provider_fails_definition() {
        let mut config = ChainConfig::new();
        config.set_defaults(
            &ChainOptions::new()
                .with_version_provider(Arc::new(
                    TableVersionProvider::new().with_version("*", "1"),
                ))
                .with_transform_executor(Arc::new(RecordingTransformExecutor::new())),
        );

        let err = ImageChain::define(["base"], &config, &ChainOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Configuration { .. }));
        assert!(err.is_definition_error());
    }

    #[tokio::test]
    async fn test_invoke_inner_task() {
        let fixture = ChainFixture::new();
        let chain = fixture.define().await.unwrap();

        let report = chain.invoke("middle_ware").await.unwrap();

        assert_eq!(report.task_ids(), vec!["base", "middle_ware"]);
        assert_eq!(fixture.compute.artifact_count(), 2);
    }

    #[tokio::test]
    async fn test_invoke_unknown_task() {
        let fixture = ChainFixture::new();
        let chain = fixture.define().await.unwrap();

        let err = chain.invoke("deploy").await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidInput { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_instances_are_awaited() {
        let fixture = ChainFixture::with_parts(
            InMemoryCompute::new().with_pending_polls(2),
            RecordingTransformExecutor::new(),
        );

        let report = fixture.run().await.unwrap();

        assert_eq!(report.built(), 3);
        assert!(fixture.compute.running_instances().is_empty());
    }

    #[tokio::test]
    async fn test_run_report_artifacts() {
        let fixture = ChainFixture::new();
        let report = fixture.run().await.unwrap();

        let types: Vec<_> = report
            .artifacts()
            .map(|a| a.tags.image_type().unwrap_or_default().to_string())
            .collect();
        assert_eq!(types, vec!["base", "middle_ware", "application"]);
        assert_eq!(report.target, "application");
    }

    #[tokio::test]
    async fn test_invoke_all() {
        let fixture = ChainFixture::new();
        let chain = fixture.define().await.unwrap();

        let report = chain.invoke_all().await.unwrap();
        assert_eq!(report.built(), 3);
    }
}
