//! Error types for the shipflow orchestrator.
//!
//! Any action failure is fatal to its enclosing stage and halts the run.
//! Recovery is always explicit: re-run the failed stage or re-plan a stale
//! change set.

use crate::deploy::TargetGroupError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for shipflow operations.
#[derive(Debug, Clone, Error)]
pub enum ShipflowError {
    /// An input artifact had no producer in the current run.
    #[error("Missing artifact '{artifact}' for action '{action}'")]
    MissingArtifact {
        /// The consuming action.
        action: String,
        /// The unresolved artifact name (or `artifact::path`).
        artifact: String,
    },

    /// The delegated external work reported failure.
    #[error("Action '{action}' failed: {reason}")]
    ActionExecution {
        /// The failing action.
        action: String,
        /// The collaborator's failure message.
        reason: String,
    },

    /// The environment diverged between plan and apply.
    #[error("Change set '{change_set}' on stack '{stack}' is stale; re-plan required")]
    StaleChangeSet {
        /// The target stack.
        stack: String,
        /// The change-set name.
        change_set: String,
    },

    /// A human rejected promotion.
    #[error("Approval rejected for action '{action}' in stage '{stage}'")]
    ApprovalRejected {
        /// The gated stage.
        stage: String,
        /// The approval action.
        action: String,
    },

    /// Execute was requested for a change set that is not `Ready`.
    #[error("Change set '{change_set}' on stack '{stack}' is not ready (status: {status})")]
    ChangeSetNotReady {
        /// The target stack.
        stack: String,
        /// The change-set name.
        change_set: String,
        /// The status it was found in.
        status: String,
    },

    /// Execute was requested for a change set that was never created.
    #[error("Change set '{change_set}' not found on stack '{stack}'")]
    ChangeSetNotFound {
        /// The target stack.
        stack: String,
        /// The change-set name.
        change_set: String,
    },

    /// An in-flight action was cancelled externally.
    #[error("Action '{action}' cancelled: {reason}")]
    Cancelled {
        /// The cancelled action.
        action: String,
        /// The cancellation reason.
        reason: String,
    },

    /// An event did not match the current state of the run.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A pipeline definition failed validation.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// Configuration was rejected.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A target group rejected its targets.
    #[error("{0}")]
    TargetGroup(#[from] TargetGroupError),

    /// An environment backend reported an error unrelated to staleness.
    #[error("Environment backend error: {0}")]
    Backend(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShipflowError {
    /// Creates a missing artifact error.
    #[must_use]
    pub fn missing_artifact(action: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::MissingArtifact {
            action: action.into(),
            artifact: artifact.into(),
        }
    }

    /// Creates an action execution error.
    #[must_use]
    pub fn action_execution(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ActionExecution {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Creates a stale change set error.
    #[must_use]
    pub fn stale_change_set(stack: impl Into<String>, change_set: impl Into<String>) -> Self {
        Self::StaleChangeSet {
            stack: stack.into(),
            change_set: change_set.into(),
        }
    }

    /// Creates an approval rejected error.
    #[must_use]
    pub fn approval_rejected(stage: impl Into<String>, action: impl Into<String>) -> Self {
        Self::ApprovalRejected {
            stage: stage.into(),
            action: action.into(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Returns a stable identifier for the error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingArtifact { .. } => "missing-artifact",
            Self::ActionExecution { .. } => "action-execution",
            Self::StaleChangeSet { .. } => "stale-change-set",
            Self::ApprovalRejected { .. } => "approval-rejected",
            Self::ChangeSetNotReady { .. } => "change-set-not-ready",
            Self::ChangeSetNotFound { .. } => "change-set-not-found",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidTransition(_) => "invalid-transition",
            Self::Validation(_) => "validation",
            Self::Config(_) => "config",
            Self::TargetGroup(_) => "target-group",
            Self::Backend(_) => "backend",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns true if the caller can recover by planning a fresh change set.
    #[must_use]
    pub fn is_retryable_by_replan(&self) -> bool {
        matches!(self, Self::StaleChangeSet { .. })
    }
}

/// The first failure of a run, kept so it is always discoverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    /// The stage the action belongs to.
    pub stage: String,
    /// The failed action.
    pub action: String,
    /// The attempt that failed (1-based).
    pub attempt: u32,
    /// Stable error code (see [`ShipflowError::code`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ActionFailure {
    /// Builds a failure record from an error.
    #[must_use]
    pub fn from_error(stage: &str, action: &str, attempt: u32, error: &ShipflowError) -> Self {
        Self {
            stage: stage.to_string(),
            action: action.to_string(),
            attempt,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Error raised when a pipeline definition is invalid.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// Machine-readable code (e.g., "PIPELINE-EMPTY").
    pub code: String,
    /// The error message.
    pub message: String,
    /// The stages or actions involved.
    pub subjects: Vec<String>,
    /// Hint for fixing the definition.
    pub fix_hint: Option<String>,
}

impl PipelineValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            subjects: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the subjects involved.
    #[must_use]
    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("subjects".to_string(), serde_json::json!(self.subjects));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        map
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required value was empty.
    #[error("Configuration field '{field}' must not be empty")]
    Empty {
        /// The offending field.
        field: String,
    },

    /// A domain was not inside the hosted zone.
    #[error("Domain '{domain}' is not inside zone '{zone}'")]
    DomainOutsideZone {
        /// The domain.
        domain: String,
        /// The zone.
        zone: String,
    },

    /// Test and prod resolved to the same domain.
    #[error("Test and prod environments share domain '{0}'")]
    SharedDomain(String),

    /// A stack name is not acceptable to the environment.
    #[error("Invalid stack name '{0}': must start with a letter and contain only letters, digits and hyphens")]
    InvalidStackName(String),

    /// A numeric field was out of range.
    #[error("Configuration field '{field}' is out of range: {value}")]
    OutOfRange {
        /// The offending field.
        field: String,
        /// The rejected value.
        value: String,
    },
}
