//! A fully wired in-memory delivery setup.

use std::sync::Arc;

use super::{InMemoryEnvironment, ScriptedBuildRunner, StaticSourceProvider};
use crate::approval::{ApprovalRequest, ApprovalService};
use crate::blueprints::{self, BACKEND_BUILD_PROJECT, BACKEND_STACK_PREFIX};
use crate::config::PipelineConfig;
use crate::deploy::{ChangeSetDeployer, EnvironmentKind};
use crate::errors::ShipflowError;
use crate::events::CollectingEventSink;
use crate::executor::{Collaborators, PipelineExecutor};
use crate::pipeline::{Pipeline, SourceChange};

/// Every collaborator of a run, in memory, sharing one event sink.
#[derive(Debug)]
pub struct TestHarness {
    /// Configuration the pipelines are built from.
    pub config: PipelineConfig,
    /// Stacks of both environments.
    pub environment: Arc<InMemoryEnvironment>,
    /// Source actions.
    pub sources: Arc<StaticSourceProvider>,
    /// Build actions.
    pub builds: Arc<ScriptedBuildRunner>,
    /// Change-set actions.
    pub deployer: Arc<ChangeSetDeployer>,
    /// Approval actions.
    pub approvals: Arc<ApprovalService>,
    /// Every run, change-set and approval event.
    pub events: Arc<CollectingEventSink>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Harness with the default configuration and a backend build rendering real templates.
    #[must_use]
    pub fn new() -> Self {
        let config = PipelineConfig::default();
        let builds = ScriptedBuildRunner::new().rendering_backend(
            BACKEND_BUILD_PROJECT,
            config.clone(),
            BACKEND_STACK_PREFIX,
        );
        Self::with_builds(config, builds)
    }

    /// Harness around a custom build runner.
    #[must_use]
    pub fn with_builds(config: PipelineConfig, builds: ScriptedBuildRunner) -> Self {
        let events = Arc::new(CollectingEventSink::new());
        let environment = Arc::new(InMemoryEnvironment::new());
        let deployer = Arc::new(
            ChangeSetDeployer::new(environment.clone()).with_event_sink(events.clone()),
        );
        Self {
            config,
            environment,
            sources: Arc::new(StaticSourceProvider::new()),
            builds: Arc::new(builds),
            deployer,
            approvals: Arc::new(ApprovalService::new()),
            events,
        }
    }

    /// The collaborators, sharing this harness's state.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.sources.clone(),
            builds: self.builds.clone(),
            deployer: self.deployer.clone(),
            approvals: self.approvals.clone(),
        }
    }

    /// A fresh executor reporting into [`Self::events`].
    #[must_use]
    pub fn executor(&self) -> PipelineExecutor {
        PipelineExecutor::new(self.collaborators()).with_event_sink(self.events.clone())
    }

    /// A push to the configured repository at `git_ref`.
    #[must_use]
    pub fn trigger(&self, git_ref: &str) -> SourceChange {
        SourceChange::new(&self.config.repo_owner, &self.config.repo_name, git_ref)
    }

    /// The backend service pipeline for this harness's configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn api_service(&self) -> Result<Arc<Pipeline>, ShipflowError> {
        blueprints::api_service(&self.config).map(Arc::new)
    }

    /// Stack name of the backend service in `kind`.
    #[must_use]
    pub fn backend_stack(&self, kind: EnvironmentKind) -> String {
        format!("{BACKEND_STACK_PREFIX}{}", kind.suffix())
    }

    /// Waits for the next approval request and decides it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request was withdrawn before the decision.
    pub async fn decide_next_approval(&self, approved: bool) -> Result<ApprovalRequest, ShipflowError> {
        let pending = self.approvals.wait_for_pending().await;
        let token = pending
            .first()
            .map(|request| request.token)
            .ok_or_else(|| ShipflowError::Internal("no pending approval".to_string()))?;
        self.approvals.resolve(token, approved)
    }
}
