//! Change sets: reviewable diffs between desired and live environment state.

use super::EnvironmentKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSetStatus {
    /// Planning is in progress.
    Pending,
    /// The diff is computed and may be executed.
    Ready,
    /// The diff was applied to the environment.
    Executed,
    /// Planning or applying failed; a new plan is required.
    Failed,
}

impl fmt::Display for ChangeSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Executed => write!(f, "executed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A point-in-time view of a stack's live state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The stack the snapshot was taken from.
    pub stack_name: String,
    /// Monotonic version, bumped on every mutation of the stack.
    pub version: u64,
    /// Logical resource id -> resource fingerprint.
    pub resources: BTreeMap<String, String>,
}

impl StateSnapshot {
    /// Creates an empty snapshot of a stack that has never been deployed.
    #[must_use]
    pub fn empty(stack_name: impl Into<String>) -> Self {
        Self {
            stack_name: stack_name.into(),
            version: 0,
            resources: BTreeMap::new(),
        }
    }
}

/// Points at one template file inside a build artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateRef {
    /// Name of the artifact holding the template.
    pub artifact: String,
    /// Opaque location of that artifact.
    pub location: String,
    /// Path of the template inside the artifact.
    pub path: String,
    /// Content digest of the template.
    pub digest: String,
}

/// How a resource changes when a change set is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// The resource is created.
    Add,
    /// The resource is updated in place or replaced.
    Modify,
    /// The resource is deleted.
    Remove,
}

/// One resource-level change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Logical id of the resource.
    pub logical_id: String,
    /// What happens to it.
    pub action: ChangeAction,
    /// Desired fingerprint after the change (`None` on removal).
    pub desired: Option<String>,
}

/// The computed difference between a live snapshot and a desired template.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StackDiff {
    /// Resource changes in logical-id order.
    pub changes: Vec<ResourceChange>,
}

impl StackDiff {
    /// Computes the diff between `live` and `desired` resource maps.
    #[must_use]
    pub fn between(live: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> Self {
        let mut changes = Vec::new();
        for (id, fingerprint) in desired {
            match live.get(id) {
                None => changes.push(ResourceChange {
                    logical_id: id.clone(),
                    action: ChangeAction::Add,
                    desired: Some(fingerprint.clone()),
                }),
                Some(current) if current != fingerprint => changes.push(ResourceChange {
                    logical_id: id.clone(),
                    action: ChangeAction::Modify,
                    desired: Some(fingerprint.clone()),
                }),
                Some(_) => {}
            }
        }
        for id in live.keys().filter(|id| !desired.contains_key(*id)) {
            changes.push(ResourceChange {
                logical_id: id.clone(),
                action: ChangeAction::Remove,
                desired: None,
            });
        }
        changes.sort_by(|a, b| a.logical_id.cmp(&b.logical_id));
        Self { changes }
    }

    /// Returns true if applying the diff would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the number of resource changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Applies the diff to a resource map.
    pub fn apply_to(&self, resources: &mut BTreeMap<String, String>) {
        for change in &self.changes {
            match (&change.action, &change.desired) {
                (ChangeAction::Remove, _) | (_, None) => {
                    resources.remove(&change.logical_id);
                }
                (_, Some(desired)) => {
                    resources.insert(change.logical_id.clone(), desired.clone());
                }
            }
        }
    }
}

/// A planned, reviewable change against one environment's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Unique id of this plan. A create-or-replace yields a new id.
    pub id: Uuid,
    /// Change-set name, unique per stack.
    pub name: String,
    /// The stack the plan was computed against.
    pub target_stack: String,
    /// The environment the stack belongs to.
    pub environment: EnvironmentKind,
    /// The desired state.
    pub template: TemplateRef,
    /// The computed diff.
    pub diff: StackDiff,
    /// Version of the live state the diff was computed from.
    pub base_version: u64,
    /// Current lifecycle status.
    pub status: ChangeSetStatus,
    /// When the plan was requested (ISO 8601).
    pub created_at: String,
}

impl ChangeSet {
    /// Creates a pending change set with an empty diff.
    #[must_use]
    pub fn pending(
        name: impl Into<String>,
        target_stack: impl Into<String>,
        environment: EnvironmentKind,
        template: TemplateRef,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            target_stack: target_stack.into(),
            environment,
            template,
            diff: StackDiff::default(),
            base_version: 0,
            status: ChangeSetStatus::Pending,
            created_at: crate::utils::iso_timestamp(),
        }
    }

    /// Returns true if the change set may be executed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == ChangeSetStatus::Ready
    }
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// The mutated stack.
    pub stack_name: String,
    /// The applied change set.
    pub change_set: String,
    /// Version of the live state after the apply.
    pub new_version: u64,
    /// Number of resource changes applied.
    pub applied_changes: usize,
}
