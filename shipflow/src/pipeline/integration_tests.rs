//! Integration tests driving the run state machine over the backend service pipeline.

#[cfg(test)]
mod tests {
    use crate::blueprints::{self, BACKEND_STACK_PREFIX};
    use crate::config::PipelineConfig;
    use crate::core::{ActionStatus, ArtifactPayload, RunStatus, StageStatus};
    use crate::deploy::render_backend_bundle;
    use crate::errors::ShipflowError;
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use crate::pipeline::{ActionConfig, Dispatch, Pipeline, PipelineRun, RunEvent, SourceChange};
    use crate::testing::{assert_halted_after, assert_run_failed_at, assert_stage_status};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use uuid::Uuid;

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(blueprints::api_service(&PipelineConfig::default()).unwrap())
    }

    fn trigger(git_ref: &str) -> SourceChange {
        SourceChange::new("aws-samples", "aws-reinvent-2018-trivia-game", git_ref)
    }

    fn start(pipeline: Arc<Pipeline>) -> (PipelineRun, Vec<Dispatch>) {
        let mut run = PipelineRun::start(pipeline, trigger("master"), Arc::new(NoOpEventSink));
        let dispatches = run.advance(RunEvent::SourceChanged).unwrap();
        (run, dispatches)
    }

    fn succeeded(dispatch: &Dispatch, output: Option<ArtifactPayload>) -> RunEvent {
        RunEvent::ActionSucceeded {
            ticket: dispatch.ticket.clone(),
            output,
        }
    }

    fn rendered_bundle(dispatch: &Dispatch) -> ArtifactPayload {
        let location = format!("build://{}", dispatch.run_id);
        render_backend_bundle(&PipelineConfig::default(), BACKEND_STACK_PREFIX, location)
            .unwrap()
            .0
    }

    /// Stage `i + 1` never leaves `NotStarted` before stage `i` succeeded.
    fn assert_stage_gating(run: &PipelineRun) {
        for pair in run.stages().windows(2) {
            if pair[1].status() != StageStatus::NotStarted {
                assert_eq!(
                    pair[0].status(),
                    StageStatus::Succeeded,
                    "stage '{}' started before '{}' succeeded",
                    pair[1].name(),
                    pair[0].name()
                );
            }
        }
    }

    /// No action leaves `Pending` before every lower group of its stage succeeded.
    fn assert_group_gating(run: &PipelineRun) {
        for stage in run.stages() {
            for action in stage.actions() {
                if action.status() == ActionStatus::Pending {
                    continue;
                }
                for lower in stage
                    .actions()
                    .iter()
                    .filter(|other| other.spec().run_order < action.spec().run_order)
                {
                    assert_eq!(
                        lower.status(),
                        ActionStatus::Succeeded,
                        "'{}' left pending before '{}'",
                        action.spec().id,
                        lower.spec().id
                    );
                }
            }
        }
    }

    struct Driven {
        parked: Vec<Dispatch>,
        seen: Vec<Dispatch>,
    }

    /// Completes every dispatch in arrival order, parking approvals.
    /// Builds render real templates; change-set actions simply succeed.
    fn drive(run: &mut PipelineRun, dispatches: Vec<Dispatch>) -> Driven {
        drive_with(run, dispatches, rendered_bundle)
    }

    fn drive_with(
        run: &mut PipelineRun,
        dispatches: Vec<Dispatch>,
        build: impl Fn(&Dispatch) -> ArtifactPayload,
    ) -> Driven {
        let mut queue: VecDeque<Dispatch> = dispatches.into();
        let mut driven = Driven {
            parked: Vec::new(),
            seen: Vec::new(),
        };
        while let Some(dispatch) = queue.pop_front() {
            driven.seen.push(dispatch.clone());
            let event = match &dispatch.action.config {
                ActionConfig::Approval { .. } => {
                    driven.parked.push(dispatch);
                    continue;
                }
                ActionConfig::Source(_) => succeeded(
                    &dispatch,
                    Some(ArtifactPayload::new(format!("src://{}", dispatch.run_id))),
                ),
                ActionConfig::Build { .. } => succeeded(&dispatch, Some(build(&dispatch))),
                ActionConfig::ChangeSetCreate { .. } | ActionConfig::ChangeSetExecute { .. } => {
                    succeeded(&dispatch, None)
                }
            };
            queue.extend(run.advance(event).unwrap());
            assert_stage_gating(run);
            assert_group_gating(run);
        }
        driven
    }

    fn resolve(run: &mut PipelineRun, approval: &Dispatch, approved: bool) -> Vec<Dispatch> {
        run.advance(RunEvent::ApprovalResolved {
            ticket: approval.ticket.clone(),
            approved,
        })
        .unwrap()
    }

    #[test]
    fn test_promotes_through_test_and_parks_on_approval() {
        let (mut run, dispatches) = start(pipeline());
        let driven = drive(&mut run, dispatches);

        assert_eq!(driven.parked.len(), 1);
        assert_eq!(driven.parked[0].action.id.as_str(), "Approve");
        assert_eq!(run.status(), RunStatus::Running);
        assert_stage_status(&run, "Test", StageStatus::Succeeded);
        assert_stage_status(&run, "Prod", StageStatus::Running);
        assert_eq!(run.action_status("PrepareChanges"), Some(ActionStatus::Pending));
        let running: Vec<String> = run.running().iter().map(ToString::to_string).collect();
        assert_eq!(running, vec!["Approve#1".to_string()]);
        assert!(!driven
            .seen
            .iter()
            .any(|d| d.action.affects_production()));
    }

    #[test]
    fn test_build_consumes_source_and_base_image() {
        let (mut run, dispatches) = start(pipeline());
        assert_eq!(dispatches.len(), 2);
        let driven = drive(&mut run, dispatches);

        let build = driven
            .seen
            .iter()
            .find(|d| d.action.id.as_str() == "CodeBuild")
            .unwrap();
        let names: Vec<&str> = build.inputs.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Source", "BaseImage"]);
    }

    #[test]
    fn test_plan_receives_template_from_build_artifact() {
        let (mut run, dispatches) = start(pipeline());
        let driven = drive(&mut run, dispatches);

        let plan = driven
            .seen
            .iter()
            .find(|d| d.action.id.as_str() == "PrepareChangesTest")
            .unwrap();
        let template = plan.template.clone().unwrap();
        let build = run.artifacts().get("Build").unwrap();

        assert_eq!(template.path, "TriviaBackendTest.template.json");
        assert_eq!(template.location, build.location);
        assert_eq!(Some(template.digest.as_str()), build.file_digest(&template.path));
    }

    #[test]
    fn test_approval_unblocks_production() {
        let sink = Arc::new(CollectingEventSink::new());
        let mut run = PipelineRun::start(pipeline(), trigger("master"), sink.clone());
        let dispatches = run.advance(RunEvent::SourceChanged).unwrap();
        let driven = drive(&mut run, dispatches);

        let next = resolve(&mut run, &driven.parked[0], true);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].action.id.as_str(), "PrepareChanges");
        assert_eq!(
            next[0].template.as_ref().map(|t| t.path.as_str()),
            Some("TriviaBackendProd.template.json")
        );

        drive(&mut run, next);
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert!(run.stages().iter().all(|s| s.status() == StageStatus::Succeeded));

        let types = sink.event_types();
        assert!(types.contains(&"approval.requested".to_string()));
        assert!(types.contains(&"approval.resolved".to_string()));
        assert_eq!(types.last().map(String::as_str), Some("pipeline.succeeded"));
    }

    #[test]
    fn test_rejection_fails_prod_and_keeps_test() {
        let (mut run, dispatches) = start(pipeline());
        let driven = drive(&mut run, dispatches);

        assert!(resolve(&mut run, &driven.parked[0], false).is_empty());

        assert_run_failed_at(&run, "Prod", "Approve", "approval-rejected");
        assert_stage_status(&run, "Test", StageStatus::Succeeded);
        assert_eq!(run.action_status("PrepareChanges"), Some(ActionStatus::Pending));
        assert_eq!(run.action_status("ExecuteChangesProd"), Some(ActionStatus::Pending));
    }

    #[test]
    fn test_template_missing_from_build_fails_plan_before_running() {
        let (mut run, dispatches) = start(pipeline());
        drive_with(&mut run, dispatches, |d| {
            ArtifactPayload::new(format!("build://{}", d.run_id))
        });

        assert_run_failed_at(&run, "Test", "PrepareChangesTest", "missing-artifact");
        let plan = run.action("PrepareChangesTest").unwrap();
        assert!(plan.current().started_at.is_none());
        assert!(run
            .first_failure()
            .unwrap()
            .message
            .contains("Build::TriviaBackendTest.template.json"));
        assert_halted_after(&run, "Test");
    }

    #[test]
    fn test_source_failure_halts_before_build() {
        let (mut run, dispatches) = start(pipeline());
        let source = &dispatches[0];
        run.advance(RunEvent::ActionFailed {
            ticket: source.ticket.clone(),
            error: ShipflowError::action_execution(source.action.id.as_str(), "repository unreachable"),
        })
        .unwrap();

        // The base image still completes; nothing is promoted.
        let next = run.advance(succeeded(&dispatches[1], Some(ArtifactPayload::new("image://base:release")))).unwrap();
        assert!(next.is_empty());
        assert_stage_status(&run, "Source", StageStatus::Failed);
        assert_halted_after(&run, "Source");
        assert!(run.artifacts().get("BaseImage").is_none());
    }

    #[test]
    fn test_stale_prod_apply_then_retry_replans() {
        let (mut run, dispatches) = start(pipeline());
        let driven = drive(&mut run, dispatches);
        let plan = resolve(&mut run, &driven.parked[0], true);
        let execute = run.advance(succeeded(&plan[0], None)).unwrap();
        assert_eq!(execute[0].action.id.as_str(), "ExecuteChangesProd");

        run.advance(RunEvent::ActionFailed {
            ticket: execute[0].ticket.clone(),
            error: ShipflowError::stale_change_set("TriviaBackendProd", "StagedChangeSet"),
        })
        .unwrap();
        assert_run_failed_at(&run, "Prod", "ExecuteChangesProd", "stale-change-set");

        // Retrying the stage re-gates and re-plans with the same build output.
        let retried = run
            .advance(RunEvent::RetryStage {
                stage: "Prod".to_string(),
            })
            .unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].action.id.as_str(), "Approve");
        assert_eq!(retried[0].ticket.attempt, 2);

        let replan = resolve(&mut run, &retried[0], true);
        assert_eq!(replan[0].ticket.attempt, 2);
        assert_eq!(replan[0].template, plan[0].template);

        drive(&mut run, replan);
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(run.failure_history().len(), 1);
        assert_eq!(run.action("ExecuteChangesProd").unwrap().history().len(), 1);
    }

    #[test]
    fn test_execute_carries_the_plan_recorded_by_this_run() {
        let (mut run, dispatches) = start(pipeline());
        let mut queue: VecDeque<Dispatch> = dispatches.into();
        let mut plan = None;
        while let Some(dispatch) = queue.pop_front() {
            let event = match &dispatch.action.config {
                ActionConfig::ChangeSetCreate { .. } => {
                    let recorded = Uuid::new_v4();
                    let execute = run
                        .advance(RunEvent::ChangeSetPlanned {
                            ticket: dispatch.ticket.clone(),
                            change_set: recorded,
                        })
                        .unwrap();
                    assert_eq!(execute[0].action.id.as_str(), "ExecuteChangesTest");
                    assert_eq!(execute[0].change_set, Some(recorded));
                    plan = Some(recorded);
                    break;
                }
                ActionConfig::Source(_) => succeeded(
                    &dispatch,
                    Some(ArtifactPayload::new(format!("src://{}", dispatch.run_id))),
                ),
                ActionConfig::Build { .. } => {
                    // Only change-set creates report plans.
                    let err = run
                        .advance(RunEvent::ChangeSetPlanned {
                            ticket: dispatch.ticket.clone(),
                            change_set: Uuid::new_v4(),
                        })
                        .unwrap_err();
                    assert_eq!(err.code(), "invalid-transition");
                    succeeded(&dispatch, Some(rendered_bundle(&dispatch)))
                }
                _ => succeeded(&dispatch, None),
            };
            queue.extend(run.advance(event).unwrap());
        }
        assert!(plan.is_some());
        assert_eq!(run.action_status("CodeBuild"), Some(ActionStatus::Succeeded));
    }

    #[test]
    fn test_plan_is_unknown_when_create_reports_none() {
        let (mut run, dispatches) = start(pipeline());
        let driven = drive(&mut run, dispatches);

        let execute = driven
            .seen
            .iter()
            .find(|d| d.action.id.as_str() == "ExecuteChangesTest")
            .unwrap();
        assert_eq!(execute.change_set, None);
    }

    #[test]
    fn test_artifacts_are_run_scoped() {
        let pipeline = pipeline();

        let (mut first, dispatches) = start(Arc::clone(&pipeline));
        drive(&mut first, dispatches);
        let (mut second, dispatches) = start(pipeline);
        assert!(second.artifacts().get("Source").is_none());

        let driven = drive(&mut second, dispatches);
        assert_ne!(first.run_id(), second.run_id());
        for dispatch in &driven.seen {
            assert!(dispatch.inputs.iter().all(|a| a.run_id == second.run_id()));
        }
        assert_ne!(
            first.artifacts().get("Build").unwrap().location,
            second.artifacts().get("Build").unwrap().location
        );
    }
}
