//! External collaborators the executor delegates work to.

use crate::approval::ApprovalGate;
use crate::core::{ActionId, ArtifactPayload, ArtifactRef};
use crate::deploy::ChangeSetDeployer;
use crate::errors::ShipflowError;
use crate::pipeline::{SourceChange, SourceLocation};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Produces the initial artifacts of a run.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fetches a snapshot of `location` for `trigger`.
    async fn fetch(
        &self,
        location: &SourceLocation,
        trigger: &SourceChange,
    ) -> Result<ArtifactPayload, ShipflowError>;
}

/// Everything a build runner gets to see.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// The run the build belongs to.
    pub run_id: Uuid,
    /// The build action.
    pub action: ActionId,
    /// The build project.
    pub project: String,
    /// Resolved inputs, primary first.
    pub inputs: Vec<ArtifactRef>,
}

/// Runs an external build. Only success or failure is consumed; logs and
/// output formats stay opaque.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Builds one output from the inputs.
    async fn build(&self, request: &BuildRequest) -> Result<ArtifactPayload, ShipflowError>;
}

/// The collaborators a [`super::PipelineExecutor`] needs.
#[derive(Clone)]
pub struct Collaborators {
    /// Source actions.
    pub source: Arc<dyn SourceProvider>,
    /// Build actions.
    pub builds: Arc<dyn BuildRunner>,
    /// Change-set actions.
    pub deployer: Arc<ChangeSetDeployer>,
    /// Approval actions.
    pub approvals: Arc<dyn ApprovalGate>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("deployer", &self.deployer)
            .finish_non_exhaustive()
    }
}
