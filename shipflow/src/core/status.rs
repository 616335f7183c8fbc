//! Action, stage and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Fetches a source snapshot or a pre-built image.
    Source,
    /// Runs an external build producing one artifact.
    Build,
    /// Waits for an exogenous human decision.
    Approval,
    /// Plans a change set against an environment (read-only).
    ChangeSetCreate,
    /// Applies a previously planned change set (mutating).
    ChangeSetExecute,
}

impl ActionKind {
    /// Returns true if the action mutates a deployment environment.
    #[must_use]
    pub fn mutates_environment(&self) -> bool {
        matches!(self, Self::ChangeSetExecute)
    }

    /// Returns true if the action touches an environment at all.
    #[must_use]
    pub fn targets_environment(&self) -> bool {
        matches!(self, Self::ChangeSetCreate | Self::ChangeSetExecute)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Build => write!(f, "build"),
            Self::Approval => write!(f, "approval"),
            Self::ChangeSetCreate => write!(f, "change_set_create"),
            Self::ChangeSetExecute => write!(f, "change_set_execute"),
        }
    }
}

/// The execution status of a single action attempt.
///
/// Transitions are `Pending -> Running -> {Succeeded | Failed}`. A terminal
/// attempt never re-enters `Running`; retries create a new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// Dispatched to a collaborator.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed, was rejected, or was cancelled.
    Failed,
}

impl ActionStatus {
    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The status of a stage, derived from its actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// No action has been dispatched.
    #[default]
    NotStarted,
    /// At least one action has been dispatched and none failed.
    Running,
    /// Every action succeeded.
    Succeeded,
    /// At least one action failed.
    Failed,
}

impl StageStatus {
    /// Derives a stage status from the statuses of its actions.
    ///
    /// Any failure dominates; an empty stage counts as succeeded.
    #[must_use]
    pub fn derive<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ActionStatus>,
    {
        let mut all_pending = true;
        let mut all_succeeded = true;
        for status in statuses {
            match status {
                ActionStatus::Failed => return Self::Failed,
                ActionStatus::Succeeded => all_pending = false,
                ActionStatus::Running => {
                    all_pending = false;
                    all_succeeded = false;
                }
                ActionStatus::Pending => all_succeeded = false,
            }
        }
        if all_succeeded {
            Self::Succeeded
        } else if all_pending {
            Self::NotStarted
        } else {
            Self::Running
        }
    }

    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The status of a whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet triggered.
    #[default]
    NotStarted,
    /// Triggered and progressing (or suspended on an external signal).
    Running,
    /// Every stage succeeded.
    Succeeded,
    /// A stage failed; no later stage will start.
    Failed,
}

impl RunStatus {
    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
