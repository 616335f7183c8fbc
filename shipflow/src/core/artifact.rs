//! Artifacts passed between actions of one pipeline run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifies an action within a pipeline. Unique across all stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl ActionId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ActionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ActionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What a collaborator hands back when its work produced an output.
///
/// The run stamps the artifact name, producer and run id; collaborators
/// only describe where the content lives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtifactPayload {
    /// Opaque reference to the stored content (bucket key, image digest, ...).
    pub location: String,
    /// File path -> content digest, for multi-file outputs such as rendered templates.
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
}

impl ArtifactPayload {
    /// Creates a payload pointing at `location`.
    #[must_use]
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            manifest: BTreeMap::new(),
        }
    }

    /// Adds a manifest entry.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, digest: impl Into<String>) -> Self {
        self.manifest.insert(path.into(), digest.into());
        self
    }
}

/// An immutable, named output of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The artifact name consumers declare as an input.
    pub name: String,
    /// The action that produced it.
    pub produced_by: ActionId,
    /// The run it belongs to. Artifacts never cross runs.
    pub run_id: Uuid,
    /// Opaque content reference.
    pub location: String,
    /// File path -> content digest.
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
    /// When the artifact was published (ISO 8601).
    pub created_at: String,
}

/// Shared, read-only handle to an artifact. Consumers hold references, never copies.
pub type ArtifactRef = Arc<Artifact>;

impl Artifact {
    /// Creates an artifact from a collaborator payload.
    #[must_use]
    pub fn from_payload(
        name: impl Into<String>,
        produced_by: ActionId,
        run_id: Uuid,
        payload: ArtifactPayload,
    ) -> Self {
        Self {
            name: name.into(),
            produced_by,
            run_id,
            location: payload.location,
            manifest: payload.manifest,
            created_at: crate::utils::iso_timestamp(),
        }
    }

    /// Returns the digest of a file inside this artifact, if present.
    #[must_use]
    pub fn file_digest(&self, path: &str) -> Option<&str> {
        self.manifest.get(path).map(String::as_str)
    }
}
