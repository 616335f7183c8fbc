//! End-to-end runs of the backend service pipeline against in-memory collaborators.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::blueprints::{BACKEND_BUILD_PROJECT, CHANGE_SET_NAME};
use crate::core::{ActionStatus, RunStatus, StageStatus};
use crate::deploy::{ChangeSetStatus, EnvironmentKind};
use crate::executor::PipelineExecutor;
use crate::pipeline::{Dispatch, PipelineRun, RunEvent};
use crate::testing::{
    assert_action_status, assert_halted_after, assert_run_failed_at, assert_run_status,
    assert_stage_status, TestHarness,
};
use pretty_assertions::assert_eq;

const TEST_STACK: &str = "TriviaBackendTest";
const PROD_STACK: &str = "TriviaBackendProd";

#[tokio::test]
async fn test_approved_run_deploys_both_environments() {
    let harness = TestHarness::new();
    let executor = harness.executor();
    let pipeline = harness.api_service().unwrap();

    let (run, decision) = tokio::join!(
        executor.run(pipeline, harness.trigger("master")),
        harness.decide_next_approval(true)
    );
    let run = run.unwrap();
    let request = decision.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(request.stage, "Prod");
    assert_eq!(request.message.as_deref(), Some("Promote to TriviaBackendProd?"));

    let build = run.artifacts().get("Build").unwrap();
    for (stack, path) in [
        (TEST_STACK, "TriviaBackendTest.template.json"),
        (PROD_STACK, "TriviaBackendProd.template.json"),
    ] {
        assert_eq!(
            harness.environment.deployed_digest(stack).as_deref(),
            build.file_digest(path)
        );
        assert_eq!(
            harness.environment.deployed_artifact(stack),
            Some(build.location.clone())
        );
    }
    assert_eq!(harness.builds.invocation_count(BACKEND_BUILD_PROJECT), 1);
    assert_eq!(harness.sources.fetch_count(), 2);
    assert_eq!(
        harness
            .events
            .event_types()
            .iter()
            .filter(|t| *t == "changeset.executed")
            .count(),
        2
    );
}

#[tokio::test]
async fn test_pending_approval_blocks_prod() {
    let harness = TestHarness::new();
    let executor = Arc::new(harness.executor());
    let pipeline = harness.api_service().unwrap();

    let handle = {
        let executor = Arc::clone(&executor);
        let trigger = harness.trigger("master");
        tokio::spawn(async move { executor.run(pipeline, trigger).await })
    };

    let pending = harness.approvals.wait_for_pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, "Approve");
    assert!(harness.environment.deployed_digest(TEST_STACK).is_some());
    assert_eq!(harness.environment.version(PROD_STACK), 0);
    assert!(harness.deployer.get(PROD_STACK, CHANGE_SET_NAME).is_none());

    executor.cancel("operator abort");
    let run = handle.await.unwrap().unwrap();

    assert_run_failed_at(&run, "Prod", "Approve", "cancelled");
    assert_eq!(harness.approvals.pending_count(), 0);
    assert_eq!(harness.environment.version(PROD_STACK), 0);
}

#[tokio::test]
async fn test_rejection_leaves_test_deployed() {
    let harness = TestHarness::new();
    let executor = harness.executor();
    let pipeline = harness.api_service().unwrap();

    let (run, decision) = tokio::join!(
        executor.run(pipeline, harness.trigger("master")),
        harness.decide_next_approval(false)
    );
    let run = run.unwrap();
    decision.unwrap();

    assert_run_failed_at(&run, "Prod", "Approve", "approval-rejected");
    assert_stage_status(&run, "Test", StageStatus::Succeeded);
    assert_action_status(&run, "PrepareChanges", ActionStatus::Pending);

    let build = run.artifacts().get("Build").unwrap();
    assert_eq!(
        harness.environment.deployed_digest(TEST_STACK).as_deref(),
        build.file_digest("TriviaBackendTest.template.json")
    );
    assert_eq!(harness.environment.deployed_digest(PROD_STACK), None);
    assert_eq!(harness.environment.apply_count(), 1);
}

#[tokio::test]
async fn test_stale_prod_apply_then_retry_replans() {
    let harness = TestHarness::new();
    let executor = harness.executor();
    let pipeline = harness.api_service().unwrap();
    harness
        .environment
        .drift_before_next_apply(PROD_STACK, "ManualEdit", "console");

    let (run, decision) = tokio::join!(
        executor.run(pipeline, harness.trigger("master")),
        harness.decide_next_approval(true)
    );
    let mut run = run.unwrap();
    decision.unwrap();

    assert_run_failed_at(&run, "Prod", "ExecuteChangesProd", "stale-change-set");
    assert_eq!(harness.environment.deployed_digest(PROD_STACK), None);
    let stale = harness.deployer.get(PROD_STACK, CHANGE_SET_NAME).unwrap();
    assert_eq!(stale.status, ChangeSetStatus::Failed);
    assert_eq!(stale.base_version, 0);

    let (resumed, decision) = tokio::join!(
        executor.resume(
            &mut run,
            RunEvent::RetryStage {
                stage: "Prod".to_string()
            }
        ),
        harness.decide_next_approval(true)
    );
    resumed.unwrap();
    decision.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    let fresh = harness.deployer.get(PROD_STACK, CHANGE_SET_NAME).unwrap();
    assert_ne!(fresh.id, stale.id);
    assert_eq!(fresh.base_version, 1);
    assert_eq!(fresh.status, ChangeSetStatus::Executed);
    assert!(harness.environment.deployed_digest(PROD_STACK).is_some());
    assert_eq!(harness.builds.invocation_count(BACKEND_BUILD_PROJECT), 1);
}

#[tokio::test]
async fn test_build_failure_halts_then_retry_recovers() {
    let harness = TestHarness::new();
    let executor = harness.executor();
    let pipeline = harness.api_service().unwrap();
    harness
        .builds
        .fail_project(BACKEND_BUILD_PROJECT, "synth failed");

    let mut run = executor
        .run(pipeline, harness.trigger("master"))
        .await
        .unwrap();

    assert_run_failed_at(&run, "Build", "CodeBuild", "action-execution");
    assert_halted_after(&run, "Build");
    assert_eq!(harness.environment.apply_count(), 0);

    harness.builds.heal(BACKEND_BUILD_PROJECT);
    let (resumed, decision) = tokio::join!(
        executor.resume(
            &mut run,
            RunEvent::RetryStage {
                stage: "Build".to_string()
            }
        ),
        harness.decide_next_approval(true)
    );
    resumed.unwrap();
    decision.unwrap();

    assert_run_status(&run, RunStatus::Succeeded);
    assert_eq!(run.action("CodeBuild").unwrap().current().attempt, 2);
    assert_eq!(harness.builds.invocation_count(BACKEND_BUILD_PROJECT), 2);
}

#[tokio::test]
async fn test_source_failure_never_reaches_build() {
    let harness = TestHarness::new();
    let executor = harness.executor();
    harness.sources.fail_with("repository unreachable");

    let run = executor
        .run(harness.api_service().unwrap(), harness.trigger("master"))
        .await
        .unwrap();

    assert_run_status(&run, RunStatus::Failed);
    assert_stage_status(&run, "Source", StageStatus::Failed);
    assert_halted_after(&run, "Source");
    assert!(harness.builds.invocations().is_empty());
}

#[tokio::test]
async fn test_second_run_only_changes_the_artifact() {
    let harness = TestHarness::new();
    let executor = harness.executor();

    for git_ref in ["v1", "v2"] {
        let (run, decision) = tokio::join!(
            executor.run(harness.api_service().unwrap(), harness.trigger(git_ref)),
            harness.decide_next_approval(true)
        );
        assert_run_status(&run.unwrap(), RunStatus::Succeeded);
        decision.unwrap();
    }

    let test = harness
        .deployer
        .get(&harness.backend_stack(EnvironmentKind::Test), CHANGE_SET_NAME)
        .unwrap();
    let changed: Vec<&str> = test
        .diff
        .changes
        .iter()
        .map(|c| c.logical_id.as_str())
        .collect();
    assert_eq!(changed, vec!["Artifact"]);
    assert_eq!(harness.environment.version(TEST_STACK), 2);
}

/// Performs dispatches in order until `action` is handed out, then returns it unperformed.
async fn step_to(executor: &PipelineExecutor, run: &mut PipelineRun, action: &str) -> Dispatch {
    let mut queue: VecDeque<Dispatch> = run.advance(RunEvent::SourceChanged).unwrap().into();
    while let Some(dispatch) = queue.pop_front() {
        if dispatch.action.id.as_str() == action {
            return dispatch;
        }
        let event = executor.perform(dispatch).await;
        queue.extend(run.advance(event).unwrap());
    }
    panic!("'{action}' was never dispatched");
}

#[tokio::test]
async fn test_interleaved_runs_apply_only_their_own_plan() {
    let harness = TestHarness::new();
    let executor = harness.executor();
    let pipeline = harness.api_service().unwrap();
    let mut first = PipelineRun::start(pipeline.clone(), harness.trigger("v1"), harness.events.clone());
    let mut second = PipelineRun::start(pipeline, harness.trigger("v2"), harness.events.clone());

    let create = step_to(&executor, &mut first, "PrepareChangesTest").await;
    let event = executor.perform(create).await;
    assert!(matches!(event, RunEvent::ChangeSetPlanned { .. }));
    let mut next = first.advance(event).unwrap();
    let execute_first = next.pop().unwrap();
    assert_eq!(execute_first.action.id.as_str(), "ExecuteChangesTest");

    // The second run re-plans the same change set before the first applies.
    let create = step_to(&executor, &mut second, "PrepareChangesTest").await;
    let event = executor.perform(create).await;
    let execute_second = second.advance(event).unwrap().pop().unwrap();
    assert!(execute_first.change_set.is_some());
    assert_ne!(execute_first.change_set, execute_second.change_set);

    let event = executor.perform(execute_first).await;
    first.advance(event).unwrap();
    assert_run_failed_at(&first, "Test", "ExecuteChangesTest", "change-set-not-ready");
    assert_eq!(harness.environment.deployed_artifact(TEST_STACK), None);
    assert_eq!(harness.environment.version(TEST_STACK), 0);

    let event = executor.perform(execute_second).await;
    second.advance(event).unwrap();
    assert_stage_status(&second, "Test", StageStatus::Succeeded);
    let build = second.artifacts().get("Build").unwrap();
    assert_eq!(
        harness.environment.deployed_artifact(TEST_STACK),
        Some(build.location.clone())
    );
    assert_eq!(
        harness.deployer.get(TEST_STACK, CHANGE_SET_NAME).unwrap().status,
        ChangeSetStatus::Executed
    );
}
