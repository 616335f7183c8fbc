//! Scripted source and build collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::core::ArtifactPayload;
use crate::deploy::render_backend_bundle;
use crate::errors::ShipflowError;
use crate::executor::{BuildRequest, BuildRunner, SourceProvider};
use crate::pipeline::{SourceChange, SourceLocation};
use crate::utils::sha256_hex;

/// A source provider answering from the trigger alone.
///
/// Repositories resolve to `git://{owner}/{repo}@{ref}`, images to
/// `image://{repository}:{tag}`.
#[derive(Debug, Default)]
pub struct StaticSourceProvider {
    failure: Mutex<Option<String>>,
    fetches: Mutex<Vec<SourceLocation>>,
}

impl StaticSourceProvider {
    /// Creates a provider that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following fetch fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    /// Makes fetches succeed again.
    pub fn heal(&self) {
        *self.failure.lock() = None;
    }

    /// Number of fetches, failed ones included.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }
}

#[async_trait]
impl SourceProvider for StaticSourceProvider {
    async fn fetch(
        &self,
        location: &SourceLocation,
        trigger: &SourceChange,
    ) -> Result<ArtifactPayload, ShipflowError> {
        self.fetches.lock().push(location.clone());
        if let Some(reason) = self.failure.lock().clone() {
            return Err(ShipflowError::Backend(reason));
        }

        let uri = match location {
            SourceLocation::Repository { owner, repo, .. } => {
                format!("git://{owner}/{repo}@{}", trigger.git_ref)
            }
            SourceLocation::ImageRepository { repository, tag } => {
                format!("image://{repository}:{tag}")
            }
        };
        Ok(ArtifactPayload::new(uri))
    }
}

#[derive(Debug, Clone)]
enum BuildOutput {
    Backend {
        config: PipelineConfig,
        stack_prefix: String,
    },
    Files(Vec<String>),
}

/// A build runner with per-project scripted behavior.
///
/// Unknown projects succeed with a bare location. Projects registered with
/// [`Self::rendering_backend`] or [`Self::rendering_files`] also return a
/// manifest of template digests.
#[derive(Debug, Default)]
pub struct ScriptedBuildRunner {
    outputs: HashMap<String, BuildOutput>,
    delay: Option<Duration>,
    failures: Mutex<HashMap<String, String>>,
    invocations: Mutex<Vec<BuildRequest>>,
}

impl ScriptedBuildRunner {
    /// Creates a runner with no scripted projects.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders the backend service templates of both environments for `project`.
    #[must_use]
    pub fn rendering_backend(
        mut self,
        project: impl Into<String>,
        config: PipelineConfig,
        stack_prefix: impl Into<String>,
    ) -> Self {
        self.outputs.insert(
            project.into(),
            BuildOutput::Backend {
                config,
                stack_prefix: stack_prefix.into(),
            },
        );
        self
    }

    /// Emits the given files for `project`, digested against the primary input.
    #[must_use]
    pub fn rendering_files(mut self, project: impl Into<String>, paths: &[&str]) -> Self {
        self.outputs.insert(
            project.into(),
            BuildOutput::Files(paths.iter().map(|p| (*p).to_string()).collect()),
        );
        self
    }

    /// Delays every build.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes builds of `project` fail with `reason`.
    pub fn fail_project(&self, project: impl Into<String>, reason: impl Into<String>) {
        self.failures.lock().insert(project.into(), reason.into());
    }

    /// Makes builds of `project` succeed again.
    pub fn heal(&self, project: &str) {
        self.failures.lock().remove(project);
    }

    /// Every request received, in arrival order.
    #[must_use]
    pub fn invocations(&self) -> Vec<BuildRequest> {
        self.invocations.lock().clone()
    }

    /// Number of builds requested for `project`.
    #[must_use]
    pub fn invocation_count(&self, project: &str) -> usize {
        self.invocations
            .lock()
            .iter()
            .filter(|r| r.project == project)
            .count()
    }
}

#[async_trait]
impl BuildRunner for ScriptedBuildRunner {
    async fn build(&self, request: &BuildRequest) -> Result<ArtifactPayload, ShipflowError> {
        self.invocations.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.failures.lock().get(&request.project).cloned() {
            return Err(ShipflowError::action_execution(request.action.as_str(), reason));
        }

        let location = format!("mem://{}/{}", request.run_id, request.action);
        match self.outputs.get(&request.project) {
            None => Ok(ArtifactPayload::new(location)),
            Some(BuildOutput::Backend {
                config,
                stack_prefix,
            }) => render_backend_bundle(config, stack_prefix, location).map(|(payload, _)| payload),
            Some(BuildOutput::Files(paths)) => {
                let source = request
                    .inputs
                    .first()
                    .map(|input| input.location.as_str())
                    .unwrap_or_default();
                Ok(paths.iter().fold(ArtifactPayload::new(location), |payload, path| {
                    let digest = sha256_hex(format!("{path}@{source}"));
                    payload.with_file(path.clone(), digest)
                }))
            }
        }
    }
}
