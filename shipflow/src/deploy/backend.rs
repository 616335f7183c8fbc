//! Environment collaborator contract.

use super::{ApplyResult, ChangeSet, StackDiff, StateSnapshot, TemplateRef};
use crate::errors::ShipflowError;
use async_trait::async_trait;

/// The external system that owns an environment's live state.
///
/// Planning (`current_state` + `diff`) must be read-only. `apply` is the
/// only mutating call and must reject a change set whose `base_version` no
/// longer matches the live state with [`ShipflowError::StaleChangeSet`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    /// Reads the live state of a stack. Unknown stacks yield an empty snapshot.
    async fn current_state(&self, stack_name: &str) -> Result<StateSnapshot, ShipflowError>;

    /// Computes the diff between a snapshot and the desired template.
    async fn diff(
        &self,
        snapshot: &StateSnapshot,
        desired: &TemplateRef,
    ) -> Result<StackDiff, ShipflowError>;

    /// Applies exactly the diff captured in `change_set`.
    async fn apply(&self, change_set: &ChangeSet) -> Result<ApplyResult, ShipflowError>;
}
