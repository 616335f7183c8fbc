//! The pipeline run state machine.
//!
//! A [`PipelineRun`] never performs work itself. [`PipelineRun::advance`]
//! consumes one external signal and returns the [`Dispatch`]es the caller
//! must start; completions come back in as further events.

use super::{ActionConfig, ActionSpec, ArtifactStore, Pipeline, SourceChange};
use crate::core::{
    ActionId, ActionKind, ActionStatus, ArtifactPayload, ArtifactRef, LifecycleEvent, RunStatus, StageStatus,
};
use crate::deploy::TemplateRef;
use crate::errors::{ActionFailure, ShipflowError};
use crate::events::EventSink;
use crate::utils::{now, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies one attempt of one action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket {
    /// The action.
    pub action: ActionId,
    /// The attempt number, starting at 1.
    pub attempt: u32,
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.action, self.attempt)
    }
}

/// (stack, change-set name) of a plan made by this run.
type PlanKey = (String, String);

/// An external signal driving a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The triggering source change arrived; starts the first stage.
    SourceChanged,
    /// The collaborator finished the action successfully.
    ActionSucceeded {
        /// The completed attempt.
        ticket: Ticket,
        /// The produced output, if the action declares one.
        output: Option<ArtifactPayload>,
    },
    /// A change-set create action finished planning.
    ChangeSetPlanned {
        /// The completed attempt.
        ticket: Ticket,
        /// Id of the plan; the matching execute action applies exactly this plan.
        change_set: Uuid,
    },
    /// The collaborator reported failure.
    ActionFailed {
        /// The failed attempt.
        ticket: Ticket,
        /// Why it failed.
        error: ShipflowError,
    },
    /// A human decided on a pending approval.
    ApprovalResolved {
        /// The approval attempt.
        ticket: Ticket,
        /// The decision.
        approved: bool,
    },
    /// The action was cancelled from outside.
    ActionCancelled {
        /// The cancelled attempt.
        ticket: Ticket,
        /// Why.
        reason: String,
    },
    /// Re-run every action of the failed stage as new attempts.
    RetryStage {
        /// The failed stage.
        stage: String,
    },
}

/// Work the caller must start on behalf of the run.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// The run the work belongs to.
    pub run_id: Uuid,
    /// Identifies the attempt; echo it back in the completion event.
    pub ticket: Ticket,
    /// The stage the action belongs to.
    pub stage: String,
    /// The action definition.
    pub action: ActionSpec,
    /// Resolved inputs, primary first.
    pub inputs: Vec<ArtifactRef>,
    /// The resolved template, for change-set plans.
    pub template: Option<TemplateRef>,
    /// The plan this run created for the change set, for change-set executes.
    pub change_set: Option<Uuid>,
    /// The trigger of the run.
    pub trigger: SourceChange,
}

/// One attempt of an action.
#[derive(Debug, Clone)]
pub struct ActionAttempt {
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Status of this attempt.
    pub status: ActionStatus,
    /// When it entered `Running`.
    pub started_at: Option<Timestamp>,
    /// When it became terminal.
    pub finished_at: Option<Timestamp>,
    /// The artifact it published, if any.
    pub output: Option<ArtifactRef>,
    /// Why it failed, if it did.
    pub failure: Option<ActionFailure>,
}

impl ActionAttempt {
    fn new(attempt: u32) -> Self {
        Self {
            attempt,
            status: ActionStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            failure: None,
        }
    }
}

/// Runtime state of one action: the current attempt plus earlier ones.
#[derive(Debug, Clone)]
pub struct ActionState {
    spec: ActionSpec,
    current: ActionAttempt,
    history: Vec<ActionAttempt>,
}

impl ActionState {
    fn new(spec: ActionSpec) -> Self {
        Self {
            spec,
            current: ActionAttempt::new(1),
            history: Vec::new(),
        }
    }

    fn retry(&mut self) {
        let next = ActionAttempt::new(self.current.attempt + 1);
        self.history.push(std::mem::replace(&mut self.current, next));
    }

    fn ticket(&self) -> Ticket {
        Ticket {
            action: self.spec.id.clone(),
            attempt: self.current.attempt,
        }
    }

    /// The action definition.
    #[must_use]
    pub fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    /// The current attempt.
    #[must_use]
    pub fn current(&self) -> &ActionAttempt {
        &self.current
    }

    /// Earlier attempts, oldest first. Always terminal.
    #[must_use]
    pub fn history(&self) -> &[ActionAttempt] {
        &self.history
    }

    /// Status of the current attempt.
    #[must_use]
    pub fn status(&self) -> ActionStatus {
        self.current.status
    }
}

/// Runtime state of one stage.
#[derive(Debug, Clone)]
pub struct StageState {
    name: String,
    actions: Vec<ActionState>,
}

impl StageState {
    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Action states in declaration order.
    #[must_use]
    pub fn actions(&self) -> &[ActionState] {
        &self.actions
    }

    /// Derived from the current attempts of all actions.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        StageStatus::derive(self.actions.iter().map(ActionState::status))
    }
}

/// One execution of a pipeline, from trigger to terminal status.
pub struct PipelineRun {
    run_id: Uuid,
    pipeline: Arc<Pipeline>,
    trigger: SourceChange,
    status: RunStatus,
    current_stage: usize,
    stages: Vec<StageState>,
    store: ArtifactStore,
    plans: HashMap<PlanKey, Uuid>,
    failure: Option<ActionFailure>,
    failure_history: Vec<ActionFailure>,
    sink: Arc<dyn EventSink>,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
}

impl PipelineRun {
    /// Creates a fresh run in `NotStarted`. Nothing happens until
    /// [`RunEvent::SourceChanged`] is delivered.
    #[must_use]
    pub fn start(pipeline: Arc<Pipeline>, trigger: SourceChange, sink: Arc<dyn EventSink>) -> Self {
        let run_id = Uuid::new_v4();
        let stages = pipeline
            .stages()
            .iter()
            .map(|stage| StageState {
                name: stage.name.clone(),
                actions: stage.actions.iter().cloned().map(ActionState::new).collect(),
            })
            .collect();

        Self {
            run_id,
            pipeline,
            trigger,
            status: RunStatus::NotStarted,
            current_stage: 0,
            stages,
            store: ArtifactStore::new(run_id),
            plans: HashMap::new(),
            failure: None,
            failure_history: Vec::new(),
            sink,
            started_at: None,
            finished_at: None,
        }
    }

    /// Applies one event and returns the work to start next.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the event does not match the current
    /// state: a stale or unknown ticket, an action that is not running, a
    /// second trigger, or a retry of a stage that has not failed. The run is
    /// left unchanged in that case.
    pub fn advance(&mut self, event: RunEvent) -> Result<Vec<Dispatch>, ShipflowError> {
        match event {
            RunEvent::SourceChanged => self.on_source_changed(),
            RunEvent::ActionSucceeded { ticket, output } => {
                let (s, a) = self.locate(&ticket)?;
                if self.stages[s].actions[a].spec.kind() == ActionKind::Approval {
                    return Err(ShipflowError::InvalidTransition(format!(
                        "approval '{ticket}' must be resolved, not completed"
                    )));
                }
                self.complete(s, a, output)
            }
            RunEvent::ChangeSetPlanned { ticket, change_set } => {
                let (s, a) = self.locate(&ticket)?;
                let ActionConfig::ChangeSetCreate {
                    environment,
                    change_set_name,
                    ..
                } = &self.stages[s].actions[a].spec.config
                else {
                    return Err(ShipflowError::InvalidTransition(format!(
                        "action '{ticket}' does not plan change sets"
                    )));
                };
                let key = (environment.stack_name.clone(), change_set_name.clone());
                debug!(run_id = %self.run_id, stack = %key.0, change_set = %key.1, id = %change_set, "Plan recorded");
                self.plans.insert(key, change_set);
                self.complete(s, a, None)
            }
            RunEvent::ActionFailed { ticket, error } => {
                let (s, a) = self.locate(&ticket)?;
                Ok(self.fail(s, a, error, false))
            }
            RunEvent::ApprovalResolved { ticket, approved } => {
                let (s, a) = self.locate(&ticket)?;
                if self.stages[s].actions[a].spec.kind() != ActionKind::Approval {
                    return Err(ShipflowError::InvalidTransition(format!(
                        "action '{ticket}' is not an approval"
                    )));
                }
                self.emit(
                    LifecycleEvent::new("approval.resolved")
                        .add_data("stage", serde_json::json!(self.stages[s].name))
                        .add_data("action", serde_json::json!(ticket.action.as_str()))
                        .add_data("approved", serde_json::json!(approved)),
                );
                if approved {
                    self.complete(s, a, None)
                } else {
                    let error =
                        ShipflowError::approval_rejected(self.stages[s].name.as_str(), ticket.action.as_str());
                    Ok(self.fail(s, a, error, false))
                }
            }
            RunEvent::ActionCancelled { ticket, reason } => {
                let (s, a) = self.locate(&ticket)?;
                Ok(self.fail(s, a, ShipflowError::cancelled(ticket.action.as_str(), reason), true))
            }
            RunEvent::RetryStage { stage } => self.on_retry(&stage),
        }
    }

    fn on_source_changed(&mut self) -> Result<Vec<Dispatch>, ShipflowError> {
        if self.status != RunStatus::NotStarted {
            return Err(ShipflowError::InvalidTransition(format!(
                "run {} already {}; each trigger starts a fresh run",
                self.run_id, self.status
            )));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(now());
        info!(
            pipeline = %self.pipeline.name(),
            run_id = %self.run_id,
            owner = %self.trigger.owner,
            repo = %self.trigger.repo,
            git_ref = %self.trigger.git_ref,
            "Pipeline run started"
        );
        self.emit(
            LifecycleEvent::new("pipeline.started")
                .add_data("owner", serde_json::json!(self.trigger.owner))
                .add_data("repo", serde_json::json!(self.trigger.repo))
                .add_data("ref", serde_json::json!(self.trigger.git_ref)),
        );
        self.start_stage(0)
    }

    fn on_retry(&mut self, stage: &str) -> Result<Vec<Dispatch>, ShipflowError> {
        if self.status != RunStatus::Failed {
            return Err(ShipflowError::InvalidTransition(format!(
                "run is {}; only a failed run can be retried",
                self.status
            )));
        }
        let s = self.current_stage;
        let failed = &self.stages[s];
        if failed.name != stage {
            return Err(ShipflowError::InvalidTransition(format!(
                "stage '{stage}' is not the failed stage '{}'",
                failed.name
            )));
        }
        if let Some(running) = failed
            .actions
            .iter()
            .find(|a| a.status() == ActionStatus::Running)
        {
            return Err(ShipflowError::InvalidTransition(format!(
                "action '{}' in stage '{stage}' is still running",
                running.spec.id
            )));
        }

        for action in &mut self.stages[s].actions {
            action.retry();
        }
        self.status = RunStatus::Running;
        self.failure = None;
        self.finished_at = None;

        info!(pipeline = %self.pipeline.name(), run_id = %self.run_id, stage, "Retrying failed stage");
        self.emit(LifecycleEvent::new("pipeline.retried").add_data("stage", serde_json::json!(stage)));
        self.start_stage(s)
    }

    /// Finds the running action a ticket refers to.
    fn locate(&self, ticket: &Ticket) -> Result<(usize, usize), ShipflowError> {
        for (s, stage) in self.stages.iter().enumerate() {
            if let Some(a) = stage.actions.iter().position(|a| a.spec.id == ticket.action) {
                let state = &stage.actions[a];
                if state.current.attempt != ticket.attempt {
                    return Err(ShipflowError::InvalidTransition(format!(
                        "stale ticket '{ticket}'; current attempt is {}",
                        state.current.attempt
                    )));
                }
                if state.status() != ActionStatus::Running {
                    return Err(ShipflowError::InvalidTransition(format!(
                        "action '{ticket}' is {}, not running",
                        state.status()
                    )));
                }
                return Ok((s, a));
            }
        }
        Err(ShipflowError::InvalidTransition(format!(
            "unknown action '{}'",
            ticket.action
        )))
    }

    fn start_stage(&mut self, s: usize) -> Result<Vec<Dispatch>, ShipflowError> {
        self.current_stage = s;
        info!(pipeline = %self.pipeline.name(), run_id = %self.run_id, stage = %self.stages[s].name, "Stage started");
        self.emit(LifecycleEvent::stage_started(&self.stages[s].name));
        self.progress(s)
    }

    /// Starts the next group of `s`, or moves past the stage once every
    /// action succeeded.
    fn progress(&mut self, s: usize) -> Result<Vec<Dispatch>, ShipflowError> {
        let stage = &self.stages[s];
        if stage.actions.iter().any(|a| a.status() == ActionStatus::Running) {
            return Ok(Vec::new());
        }

        let next_group = stage
            .actions
            .iter()
            .filter(|a| a.status() != ActionStatus::Succeeded)
            .map(|a| a.spec.run_order)
            .min();
        if let Some(run_order) = next_group {
            return Ok(self.dispatch_group(s, run_order));
        }

        info!(pipeline = %self.pipeline.name(), run_id = %self.run_id, stage = %stage.name, "Stage succeeded");
        self.emit(LifecycleEvent::stage_succeeded(&self.stages[s].name));

        if s + 1 < self.stages.len() {
            return self.start_stage(s + 1);
        }

        self.status = RunStatus::Succeeded;
        self.finished_at = Some(now());
        info!(pipeline = %self.pipeline.name(), run_id = %self.run_id, "Pipeline run succeeded");
        self.emit(LifecycleEvent::new("pipeline.succeeded"));
        Ok(Vec::new())
    }

    /// Resolves every action of the group before starting any of them.
    fn dispatch_group(&mut self, s: usize, run_order: u32) -> Vec<Dispatch> {
        let members: Vec<usize> = self.stages[s]
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.spec.run_order == run_order)
            .map(|(a, _)| a)
            .collect();

        let mut resolved = Vec::with_capacity(members.len());
        for a in members {
            let spec = &self.stages[s].actions[a].spec;
            let inputs = self.store.resolve_inputs(spec).and_then(|inputs| {
                let template = self.store.resolve_template(spec)?;
                Ok((inputs, template, self.planned_change_set(spec)))
            });
            match inputs {
                Ok((inputs, template, change_set)) => resolved.push((a, inputs, template, change_set)),
                // Pending -> Failed: the action never started.
                Err(err) => return self.fail(s, a, err, false),
            }
        }

        let mut dispatches = Vec::with_capacity(resolved.len());
        for (a, inputs, template, change_set) in resolved {
            let stage_name = self.stages[s].name.clone();
            let state = &mut self.stages[s].actions[a];
            state.current.status = ActionStatus::Running;
            state.current.started_at = Some(now());
            let ticket = state.ticket();
            let action = state.spec.clone();

            debug!(
                pipeline = %self.pipeline.name(),
                run_id = %self.run_id,
                stage = %stage_name,
                action = %ticket.action,
                attempt = ticket.attempt,
                kind = %action.kind(),
                inputs = inputs.len(),
                "Action started"
            );
            self.emit(LifecycleEvent::action_started(
                &stage_name,
                ticket.action.as_str(),
                ticket.attempt,
            ));
            if action.kind() == ActionKind::Approval {
                self.emit(
                    LifecycleEvent::new("approval.requested")
                        .add_data("stage", serde_json::json!(stage_name))
                        .add_data("action", serde_json::json!(ticket.action.as_str())),
                );
            }

            dispatches.push(Dispatch {
                run_id: self.run_id,
                ticket,
                stage: stage_name,
                action,
                inputs,
                template,
                change_set,
                trigger: self.trigger.clone(),
            });
        }
        dispatches
    }

    /// The plan this run recorded for an execute action's change set.
    fn planned_change_set(&self, spec: &ActionSpec) -> Option<Uuid> {
        match &spec.config {
            ActionConfig::ChangeSetExecute {
                environment,
                change_set_name,
            } => self
                .plans
                .get(&(environment.stack_name.clone(), change_set_name.clone()))
                .copied(),
            _ => None,
        }
    }

    fn complete(
        &mut self,
        s: usize,
        a: usize,
        output: Option<ArtifactPayload>,
    ) -> Result<Vec<Dispatch>, ShipflowError> {
        let halted = self.status != RunStatus::Running;
        let spec = &self.stages[s].actions[a].spec;
        let action_id = spec.id.clone();

        let mut published = None;
        if !halted {
            if let Some(name) = spec.output.clone() {
                let Some(payload) = output else {
                    let error = ShipflowError::action_execution(
                        action_id.as_str(),
                        format!("declared output '{name}' but produced none"),
                    );
                    return Ok(self.fail(s, a, error, false));
                };
                published = Some(self.store.publish(&name, action_id.clone(), payload));
            }
        }

        let stage_name = self.stages[s].name.clone();
        let state = &mut self.stages[s].actions[a];
        state.current.status = ActionStatus::Succeeded;
        state.current.finished_at = Some(now());
        state.current.output.clone_from(&published);
        let attempt = state.current.attempt;

        info!(
            pipeline = %self.pipeline.name(),
            run_id = %self.run_id,
            stage = %stage_name,
            action = %action_id,
            attempt,
            "Action succeeded"
        );
        self.emit(LifecycleEvent::action_succeeded(&stage_name, action_id.as_str(), attempt));
        if let Some(artifact) = published {
            self.emit(LifecycleEvent::artifact_published(
                &artifact.name,
                artifact.produced_by.as_str(),
                &artifact.location,
            ));
        }

        if halted {
            debug!(
                run_id = %self.run_id,
                action = %action_id,
                "Result recorded after stage failure; not used for promotion"
            );
            return Ok(Vec::new());
        }
        self.progress(s)
    }

    /// Marks the current attempt failed and halts the run on the first failure.
    fn fail(&mut self, s: usize, a: usize, error: ShipflowError, cancelled: bool) -> Vec<Dispatch> {
        let stage_name = self.stages[s].name.clone();
        let state = &mut self.stages[s].actions[a];
        let failure =
            ActionFailure::from_error(&stage_name, state.spec.id.as_str(), state.current.attempt, &error);
        state.current.status = ActionStatus::Failed;
        state.current.finished_at = Some(now());
        state.current.failure = Some(failure.clone());
        let attempt = state.current.attempt;

        warn!(
            pipeline = %self.pipeline.name(),
            run_id = %self.run_id,
            stage = %stage_name,
            action = %failure.action,
            attempt,
            code = %failure.code,
            error = %error,
            "Action failed"
        );
        let event = match &error {
            ShipflowError::Cancelled { reason, .. } if cancelled => {
                LifecycleEvent::action_cancelled(&stage_name, &failure.action, attempt, reason)
            }
            _ => LifecycleEvent::action_failed(
                &stage_name,
                &failure.action,
                attempt,
                &failure.code,
                &failure.message,
            ),
        };
        self.emit(event);
        self.failure_history.push(failure.clone());

        if self.status == RunStatus::Running {
            self.status = RunStatus::Failed;
            self.finished_at = Some(now());
            warn!(
                pipeline = %self.pipeline.name(),
                run_id = %self.run_id,
                stage = %stage_name,
                action = %failure.action,
                "Pipeline run failed"
            );
            self.emit(LifecycleEvent::stage_failed(&stage_name, &failure.action));
            self.emit(
                LifecycleEvent::new("pipeline.failed")
                    .add_data("stage", serde_json::json!(stage_name))
                    .add_data("action", serde_json::json!(failure.action))
                    .add_data("code", serde_json::json!(failure.code)),
            );
            self.failure = Some(failure);
        }
        Vec::new()
    }

    fn emit(&self, event: LifecycleEvent) {
        event
            .for_run(self.pipeline.name(), &self.run_id)
            .emit_to(self.sink.as_ref());
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The pipeline being run.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The trigger.
    #[must_use]
    pub fn trigger(&self) -> &SourceChange {
        &self.trigger
    }

    /// The run status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Index of the stage the run is in (or halted at).
    #[must_use]
    pub fn current_stage_index(&self) -> usize {
        self.current_stage
    }

    /// Name of the stage the run is in, once started.
    #[must_use]
    pub fn current_stage(&self) -> Option<&str> {
        (self.status != RunStatus::NotStarted).then(|| self.stages[self.current_stage].name.as_str())
    }

    /// Stage states in pipeline order.
    #[must_use]
    pub fn stages(&self) -> &[StageState] {
        &self.stages
    }

    /// Derived status of a stage.
    #[must_use]
    pub fn stage_status(&self, stage: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|s| s.name == stage)
            .map(StageState::status)
    }

    /// State of an action.
    #[must_use]
    pub fn action(&self, id: &str) -> Option<&ActionState> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter())
            .find(|a| a.spec.id.as_str() == id)
    }

    /// Status of an action's current attempt.
    #[must_use]
    pub fn action_status(&self, id: &str) -> Option<ActionStatus> {
        self.action(id).map(ActionState::status)
    }

    /// Tickets of all running actions.
    #[must_use]
    pub fn running(&self) -> Vec<Ticket> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter(|a| a.status() == ActionStatus::Running)
            .map(ActionState::ticket)
            .collect()
    }

    /// Returns true when no action is running.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.running().is_empty()
    }

    /// The failure that halted the run, if it is currently failed.
    #[must_use]
    pub fn first_failure(&self) -> Option<&ActionFailure> {
        self.failure.as_ref()
    }

    /// Every failure recorded in this run, across retries.
    #[must_use]
    pub fn failure_history(&self) -> &[ActionFailure] {
        &self.failure_history
    }

    /// Artifacts published by this run.
    #[must_use]
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.store
    }

    /// When the run started.
    #[must_use]
    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    /// When the run last became terminal.
    #[must_use]
    pub fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }
}

impl fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRun")
            .field("run_id", &self.run_id)
            .field("pipeline", &self.pipeline.name())
            .field("status", &self.status)
            .field("current_stage", &self.current_stage)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use crate::pipeline::{PipelineBuilder, StageSpec};
    use pretty_assertions::assert_eq;

    fn trigger() -> SourceChange {
        SourceChange::new("acme", "app", "main")
    }

    /// Source -> Build (two actions at rc1, one at rc2).
    fn pipeline() -> Arc<Pipeline> {
        Arc::new(
            PipelineBuilder::new("app")
                .stage(
                    StageSpec::new("Source").with_action(
                        ActionSpec::repository_source("Checkout", "acme", "app", "main")
                            .with_output("Source"),
                    ),
                )
                .stage(
                    StageSpec::new("Build")
                        .with_action(ActionSpec::build("Compile", "b").with_input("Source").with_output("Bin"))
                        .with_action(ActionSpec::build("Lint", "l").with_input("Source"))
                        .with_action(
                            ActionSpec::build("Package", "p")
                                .with_input("Bin")
                                .with_run_order(2)
                                .with_output("Package"),
                        ),
                )
                .build()
                .unwrap(),
        )
    }

    fn ok(ticket: &Ticket, location: Option<&str>) -> RunEvent {
        RunEvent::ActionSucceeded {
            ticket: ticket.clone(),
            output: location.map(ArtifactPayload::new),
        }
    }

    fn tickets(dispatches: &[Dispatch]) -> Vec<Ticket> {
        dispatches.iter().map(|d| d.ticket.clone()).collect()
    }

    #[test]
    fn test_fresh_run_is_not_started() {
        let run = PipelineRun::start(pipeline(), trigger(), Arc::new(NoOpEventSink));
        assert_eq!(run.status(), RunStatus::NotStarted);
        assert_eq!(run.current_stage(), None);
        assert_eq!(run.stage_status("Source"), Some(StageStatus::NotStarted));
    }

    #[test]
    fn test_happy_path() {
        let sink = Arc::new(CollectingEventSink::new());
        let mut run = PipelineRun::start(pipeline(), trigger(), sink.clone());

        let d = run.advance(RunEvent::SourceChanged).unwrap();
        assert_eq!(tickets(&d), vec![Ticket { action: "Checkout".into(), attempt: 1 }]);
        assert_eq!(d[0].trigger, trigger());

        let d = run.advance(ok(&d[0].ticket, Some("git://acme/app@abc"))).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(run.stage_status("Source"), Some(StageStatus::Succeeded));
        assert_eq!(run.stage_status("Build"), Some(StageStatus::Running));
        assert_eq!(d[0].inputs[0].location, "git://acme/app@abc");

        let compile = d[0].ticket.clone();
        let lint = d[1].ticket.clone();
        assert!(run.advance(ok(&compile, Some("bin://1"))).unwrap().is_empty());
        assert_eq!(run.action_status("Package"), Some(ActionStatus::Pending));

        let d = run.advance(ok(&lint, None)).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].inputs[0].name, "Bin");

        assert!(run.advance(ok(&d[0].ticket, Some("pkg://1"))).unwrap().is_empty());
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert!(run.finished_at().is_some());
        assert_eq!(run.artifacts().len(), 3);

        let types = sink.event_types();
        assert_eq!(types.first().map(String::as_str), Some("pipeline.started"));
        assert_eq!(types.last().map(String::as_str), Some("pipeline.succeeded"));
        assert_eq!(types.iter().filter(|t| *t == "artifact.published").count(), 3);
    }

    #[test]
    fn test_second_trigger_rejected() {
        let mut run = PipelineRun::start(pipeline(), trigger(), Arc::new(NoOpEventSink));
        run.advance(RunEvent::SourceChanged).unwrap();
        assert!(matches!(
            run.advance(RunEvent::SourceChanged),
            Err(ShipflowError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_failure_halts_and_sibling_output_not_published() {
        let mut run = PipelineRun::start(pipeline(), trigger(), Arc::new(NoOpEventSink));
        let d = run.advance(RunEvent::SourceChanged).unwrap();
        let d = run.advance(ok(&d[0].ticket, Some("src"))).unwrap();

        run.advance(RunEvent::ActionFailed {
            ticket: d[1].ticket.clone(),
            error: ShipflowError::action_execution("Lint", "style violations"),
        })
        .unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.stage_status("Build"), Some(StageStatus::Failed));

        // The running sibling may still finish; its output is not used.
        let d = run.advance(ok(&d[0].ticket, Some("bin://1"))).unwrap();
        assert!(d.is_empty());
        assert_eq!(run.action_status("Compile"), Some(ActionStatus::Succeeded));
        assert!(run.artifacts().get("Bin").is_none());
        assert_eq!(run.action_status("Package"), Some(ActionStatus::Pending));

        let failure = run.first_failure().unwrap();
        assert_eq!(failure.stage, "Build");
        assert_eq!(failure.action, "Lint");
        assert_eq!(failure.code, "action-execution");
    }

    #[test]
    fn test_missing_output_fails_action() {
        let mut run = PipelineRun::start(pipeline(), trigger(), Arc::new(NoOpEventSink));
        let d = run.advance(RunEvent::SourceChanged).unwrap();
        run.advance(ok(&d[0].ticket, None)).unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.action_status("Checkout"), Some(ActionStatus::Failed));
    }

    #[test]
    fn test_unknown_and_idle_tickets_rejected() {
        let mut run = PipelineRun::start(pipeline(), trigger(), Arc::new(NoOpEventSink));
        run.advance(RunEvent::SourceChanged).unwrap();

        let idle = Ticket { action: "Package".into(), attempt: 1 };
        assert!(run.advance(ok(&idle, None)).is_err());

        let unknown = Ticket { action: "Nope".into(), attempt: 1 };
        assert!(run.advance(ok(&unknown, None)).is_err());
        assert_eq!(run.status(), RunStatus::Running);
    }

    #[test]
    fn test_retry_creates_new_attempts() {
        let sink = Arc::new(CollectingEventSink::new());
        let mut run = PipelineRun::start(pipeline(), trigger(), sink.clone());
        let d = run.advance(RunEvent::SourceChanged).unwrap();
        let first = d[0].ticket.clone();
        run.advance(RunEvent::ActionFailed {
            ticket: first.clone(),
            error: ShipflowError::action_execution("Checkout", "clone failed"),
        })
        .unwrap();

        let d = run
            .advance(RunEvent::RetryStage { stage: "Source".to_string() })
            .unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        assert!(run.first_failure().is_none());
        assert_eq!(d[0].ticket.attempt, 2);

        // The old attempt stays terminal and its ticket is stale.
        let state = run.action("Checkout").unwrap();
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.history()[0].status, ActionStatus::Failed);
        assert!(matches!(
            run.advance(ok(&first, Some("src"))),
            Err(ShipflowError::InvalidTransition(_))
        ));

        run.advance(ok(&d[0].ticket, Some("src"))).unwrap();
        assert_eq!(run.stage_status("Source"), Some(StageStatus::Succeeded));
        assert_eq!(run.failure_history().len(), 1);
        assert!(sink.event_types().contains(&"pipeline.retried".to_string()));
    }

    #[test]
    fn test_retry_rejected_while_sibling_running() {
        let mut run = PipelineRun::start(pipeline(), trigger(), Arc::new(NoOpEventSink));
        let d = run.advance(RunEvent::SourceChanged).unwrap();
        let d = run.advance(ok(&d[0].ticket, Some("src"))).unwrap();
        run.advance(RunEvent::ActionCancelled {
            ticket: d[0].ticket.clone(),
            reason: "operator".to_string(),
        })
        .unwrap();

        let err = run
            .advance(RunEvent::RetryStage { stage: "Build".to_string() })
            .unwrap_err();
        assert!(err.to_string().contains("still running"));

        run.advance(ok(&d[1].ticket, None)).unwrap();
        let d = run
            .advance(RunEvent::RetryStage { stage: "Build".to_string() })
            .unwrap();
        assert_eq!(d.len(), 2);
        assert!(d.iter().all(|d| d.ticket.attempt == 2));
    }

    #[test]
    fn test_retry_rejected_for_other_stage_or_running_run() {
        let mut run = PipelineRun::start(pipeline(), trigger(), Arc::new(NoOpEventSink));
        run.advance(RunEvent::SourceChanged).unwrap();
        assert!(run
            .advance(RunEvent::RetryStage { stage: "Source".to_string() })
            .is_err());
    }

    #[test]
    fn test_cancel_is_failure_for_sequencing() {
        let sink = Arc::new(CollectingEventSink::new());
        let mut run = PipelineRun::start(pipeline(), trigger(), sink.clone());
        let d = run.advance(RunEvent::SourceChanged).unwrap();
        run.advance(RunEvent::ActionCancelled {
            ticket: d[0].ticket.clone(),
            reason: "superseded".to_string(),
        })
        .unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.first_failure().unwrap().code, "cancelled");
        assert_eq!(run.stage_status("Build"), Some(StageStatus::NotStarted));
        assert!(sink.event_types().contains(&"action.cancelled".to_string()));
    }
}
