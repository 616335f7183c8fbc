//! Async driver feeding a [`PipelineRun`] until it settles.

use super::{BuildRequest, Collaborators};
use crate::approval::{ApprovalGate, PendingToken};
use crate::cancellation::CancellationToken;
use crate::core::ArtifactPayload;
use crate::errors::ShipflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::observability::SpanTimer;
use crate::pipeline::{ActionConfig, Dispatch, Pipeline, PipelineRun, RunEvent, SourceChange};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// Drives pipeline runs against real collaborators.
///
/// Actions of one group run as concurrent tasks. The executor keeps no
/// memory between runs.
pub struct PipelineExecutor {
    collaborators: Collaborators,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            sink: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the sink receiving run lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the token that cancels in-flight actions.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// Cancels every in-flight action; each is reported as cancelled.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Starts a fresh run for `trigger` and drives it until nothing is in flight.
    ///
    /// The returned run is terminal: succeeded, or failed with its first
    /// failure recorded.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state machine rejects an event, which
    /// indicates a bug rather than a pipeline failure.
    pub async fn run(
        &self,
        pipeline: Arc<Pipeline>,
        trigger: SourceChange,
    ) -> Result<PipelineRun, ShipflowError> {
        let mut run = PipelineRun::start(pipeline, trigger, Arc::clone(&self.sink));
        self.resume(&mut run, RunEvent::SourceChanged).await?;
        Ok(run)
    }

    /// Delivers `event` to an existing run (typically `RetryStage`) and
    /// drives it until nothing is in flight.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the run rejects `event`.
    pub async fn resume(&self, run: &mut PipelineRun, event: RunEvent) -> Result<(), ShipflowError> {
        let span = info_span!("pipeline_run", pipeline = %run.pipeline().name(), run_id = %run.run_id());
        self.drive(run, event).instrument(span).await
    }

    async fn drive(&self, run: &mut PipelineRun, event: RunEvent) -> Result<(), ShipflowError> {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, RunEvent>> = FuturesUnordered::new();
        for dispatch in run.advance(event)? {
            in_flight.push(self.launch(dispatch));
        }

        while let Some(event) = in_flight.next().await {
            for dispatch in run.advance(event)? {
                in_flight.push(self.launch(dispatch));
            }
        }

        info!(status = %run.status(), stage = ?run.current_stage(), "Pipeline run settled");
        Ok(())
    }

    /// Performs one dispatch inline and returns its completion event.
    ///
    /// For callers stepping a [`PipelineRun`] themselves; not subject to
    /// [`Self::cancel`].
    pub async fn perform(&self, dispatch: Dispatch) -> RunEvent {
        perform(&self.collaborators, dispatch).await
    }

    /// Spawns one action as its own task.
    fn launch(&self, dispatch: Dispatch) -> BoxFuture<'static, RunEvent> {
        let ticket = dispatch.ticket.clone();
        let collaborators = self.collaborators.clone();
        let cancel = Arc::clone(&self.cancel);

        let handle = tokio::spawn(async move {
            let ticket = dispatch.ticket.clone();
            tokio::select! {
                event = perform(&collaborators, dispatch) => event,
                reason = cancel.cancelled() => RunEvent::ActionCancelled { ticket, reason },
            }
        });

        async move {
            handle.await.unwrap_or_else(|err| RunEvent::ActionFailed {
                ticket,
                error: ShipflowError::Internal(format!("action task aborted: {err}")),
            })
        }
        .boxed()
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("collaborators", &self.collaborators)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// Withdraws an approval request if the waiting action is dropped.
struct WithdrawOnDrop<'a> {
    gate: &'a dyn ApprovalGate,
    token: PendingToken,
}

impl Drop for WithdrawOnDrop<'_> {
    fn drop(&mut self) {
        self.gate.withdraw(self.token);
    }
}

/// What a finished action hands back to the run.
enum Outcome {
    Output(Option<ArtifactPayload>),
    Planned(Uuid),
}

async fn perform(collaborators: &Collaborators, dispatch: Dispatch) -> RunEvent {
    let Dispatch {
        run_id,
        ticket,
        stage,
        action,
        inputs,
        template,
        change_set,
        trigger,
    } = dispatch;
    let timer = SpanTimer::start(action.id.as_str());

    let result: Result<Outcome, ShipflowError> = match &action.config {
        ActionConfig::Source(location) => collaborators
            .source
            .fetch(location, &trigger)
            .await
            .map(|payload| Outcome::Output(Some(payload))),
        ActionConfig::Build { project } => {
            let request = BuildRequest {
                run_id,
                action: action.id.clone(),
                project: project.clone(),
                inputs,
            };
            collaborators
                .builds
                .build(&request)
                .await
                .map(|payload| Outcome::Output(Some(payload)))
        }
        ActionConfig::Approval { message } => {
            let gate = collaborators.approvals.as_ref();
            let pending = gate.notify(run_id, &stage, action.id.as_str(), message.as_deref());
            let _guard = WithdrawOnDrop {
                gate,
                token: pending.request.token,
            };
            return match pending.decision.await {
                Ok(approved) => RunEvent::ApprovalResolved { ticket, approved },
                Err(_) => RunEvent::ActionCancelled {
                    ticket,
                    reason: "approval request withdrawn".to_string(),
                },
            };
        }
        ActionConfig::ChangeSetCreate {
            environment,
            change_set_name,
            template_path,
        } => match template {
            Some(template) => collaborators
                .deployer
                .create_change_set(environment, change_set_name, template)
                .await
                .map(|planned| Outcome::Planned(planned.id)),
            None => Err(ShipflowError::missing_artifact(
                action.id.as_str(),
                template_path.as_str(),
            )),
        },
        ActionConfig::ChangeSetExecute {
            environment,
            change_set_name,
        } => match change_set {
            Some(id) => collaborators
                .deployer
                .execute_planned(&environment.stack_name, change_set_name, id)
                .await
                .map(|_| Outcome::Output(None)),
            None => Err(ShipflowError::ChangeSetNotFound {
                stack: environment.stack_name.clone(),
                change_set: change_set_name.clone(),
            }),
        },
    };

    debug!(
        stage = %stage,
        action = %ticket.action,
        attempt = ticket.attempt,
        ok = result.is_ok(),
        duration_ms = timer.finish(),
        "Action finished"
    );
    match result {
        Ok(Outcome::Output(output)) => RunEvent::ActionSucceeded { ticket, output },
        Ok(Outcome::Planned(change_set)) => RunEvent::ChangeSetPlanned { ticket, change_set },
        Err(error) => RunEvent::ActionFailed { ticket, error },
    }
}
