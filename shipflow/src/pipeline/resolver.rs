//! Run-scoped artifact resolution.

use super::{ActionConfig, ActionSpec};
use crate::core::{ActionId, Artifact, ArtifactPayload, ArtifactRef};
use crate::deploy::TemplateRef;
use crate::errors::ShipflowError;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Artifacts published during one run.
///
/// Each run owns its own store, so an input can only ever resolve to an
/// artifact produced by the same run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_id: Uuid,
    latest: HashMap<String, ArtifactRef>,
    published: Vec<ArtifactRef>,
}

impl ArtifactStore {
    /// Creates an empty store for `run_id`.
    #[must_use]
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            latest: HashMap::new(),
            published: Vec::new(),
        }
    }

    /// The run this store belongs to.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Publishes `payload` as artifact `name`. A later publish of the same
    /// name shadows the earlier one.
    pub fn publish(&mut self, name: &str, produced_by: ActionId, payload: ArtifactPayload) -> ArtifactRef {
        let artifact = Arc::new(Artifact::from_payload(name, produced_by, self.run_id, payload));
        self.latest.insert(name.to_string(), Arc::clone(&artifact));
        self.published.push(Arc::clone(&artifact));
        artifact
    }

    /// Returns the most recent artifact named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ArtifactRef> {
        self.latest.get(name).cloned()
    }

    /// Resolves every input of `action`, primary inputs first.
    ///
    /// # Errors
    ///
    /// Returns `MissingArtifact` for the first input with no producer yet.
    pub fn resolve_inputs(&self, action: &ActionSpec) -> Result<Vec<ArtifactRef>, ShipflowError> {
        action
            .all_inputs()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| ShipflowError::missing_artifact(action.id.as_str(), name))
            })
            .collect()
    }

    /// Resolves the template a change-set plan reads from its first input.
    ///
    /// Returns `Ok(None)` for any other kind of action.
    ///
    /// # Errors
    ///
    /// Returns `MissingArtifact` if the input artifact is missing or does not
    /// contain the template path.
    pub fn resolve_template(&self, action: &ActionSpec) -> Result<Option<TemplateRef>, ShipflowError> {
        let ActionConfig::ChangeSetCreate { template_path, .. } = &action.config else {
            return Ok(None);
        };
        let Some(artifact_name) = action.inputs.first() else {
            return Err(ShipflowError::missing_artifact(action.id.as_str(), template_path.as_str()));
        };
        let artifact = self
            .get(artifact_name)
            .ok_or_else(|| ShipflowError::missing_artifact(action.id.as_str(), artifact_name.as_str()))?;
        let digest = artifact.file_digest(template_path).ok_or_else(|| {
            ShipflowError::missing_artifact(
                action.id.as_str(),
                format!("{artifact_name}::{template_path}"),
            )
        })?;

        Ok(Some(TemplateRef {
            artifact: artifact.name.clone(),
            location: artifact.location.clone(),
            path: template_path.clone(),
            digest: digest.to_string(),
        }))
    }

    /// All artifacts in publish order.
    #[must_use]
    pub fn published(&self) -> &[ArtifactRef] {
        &self.published
    }

    /// Number of artifacts published.
    #[must_use]
    pub fn len(&self) -> usize {
        self.published.len()
    }

    /// Returns true if nothing was published yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.published.is_empty()
    }
}
