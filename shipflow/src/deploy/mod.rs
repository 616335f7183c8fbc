//! Change-set deployment against isolated environments.
//!
//! Deploying is two-phase: `create_change_set` computes a read-only diff
//! against the environment's current state, and `execute_change_set` applies
//! exactly that diff. Executing is the only path that mutates an environment.

mod backend;
mod changeset;
mod deployer;
mod environment;
mod target_group;
mod template;

pub use backend::EnvironmentBackend;
#[cfg(test)]
pub use backend::MockEnvironmentBackend;
pub use changeset::{
    ApplyResult, ChangeAction, ChangeSet, ChangeSetStatus, ResourceChange, StackDiff,
    StateSnapshot, TemplateRef,
};
pub use deployer::ChangeSetDeployer;
pub use environment::{is_valid_stack_name, Environment, EnvironmentKind};
pub use target_group::{Target, TargetGroup, TargetGroupError, TargetGroupState, TargetType};
pub use template::{render_backend_bundle, template_file_name, Resource, StackTemplate};
