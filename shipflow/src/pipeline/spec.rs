//! Pipeline, stage and action definitions.
//!
//! Definitions are plain data fixed at construction; runs hold them behind
//! an `Arc` and never mutate them.

use crate::core::{ActionId, ActionKind};
use crate::deploy::Environment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The source-change notification that triggers a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceChange {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// The changed ref (branch, tag or commit).
    #[serde(rename = "ref")]
    pub git_ref: String,
}

impl SourceChange {
    /// Creates a trigger.
    #[must_use]
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            git_ref: git_ref.into(),
        }
    }
}

/// Where a source action reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceLocation {
    /// A git repository; the ref comes from the trigger.
    Repository {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Tracked branch.
        branch: String,
    },
    /// A pre-built image in an image repository.
    ImageRepository {
        /// Image repository name.
        repository: String,
        /// Image tag.
        tag: String,
    },
}

/// Kind-specific configuration of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionConfig {
    /// Fetch a source snapshot or image.
    Source(SourceLocation),
    /// Run an external build project.
    Build {
        /// Build project, e.g. the build-spec path.
        project: String,
    },
    /// Wait for a human decision.
    Approval {
        /// Message shown to the approver.
        message: Option<String>,
    },
    /// Plan a change set (read-only).
    ChangeSetCreate {
        /// Target environment.
        environment: Environment,
        /// Change-set name, unique per stack.
        change_set_name: String,
        /// Template file inside the first input artifact.
        template_path: String,
    },
    /// Apply a previously planned change set.
    ChangeSetExecute {
        /// Target environment.
        environment: Environment,
        /// Change-set name, unique per stack.
        change_set_name: String,
    },
}

impl ActionConfig {
    /// Returns the action kind.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Source(_) => ActionKind::Source,
            Self::Build { .. } => ActionKind::Build,
            Self::Approval { .. } => ActionKind::Approval,
            Self::ChangeSetCreate { .. } => ActionKind::ChangeSetCreate,
            Self::ChangeSetExecute { .. } => ActionKind::ChangeSetExecute,
        }
    }

    /// Returns the environment targeted by change-set actions.
    #[must_use]
    pub fn environment(&self) -> Option<&Environment> {
        match self {
            Self::ChangeSetCreate { environment, .. }
            | Self::ChangeSetExecute { environment, .. } => Some(environment),
            _ => None,
        }
    }

    /// Returns `(stack, change set)` for change-set actions.
    #[must_use]
    pub fn change_set_key(&self) -> Option<(&str, &str)> {
        match self {
            Self::ChangeSetCreate {
                environment,
                change_set_name,
                ..
            }
            | Self::ChangeSetExecute {
                environment,
                change_set_name,
            } => Some((environment.stack_name.as_str(), change_set_name.as_str())),
            _ => None,
        }
    }
}

/// Specification of a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Unique id across the pipeline.
    pub id: ActionId,
    /// Kind-specific configuration.
    pub config: ActionConfig,
    /// Group within the stage; lower groups complete first. Starts at 1.
    pub run_order: u32,
    /// Primary input artifact names, in order.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Extra inputs that must also resolve before the action may run.
    #[serde(default)]
    pub additional_inputs: Vec<String>,
    /// Name of the produced artifact, if any.
    pub output: Option<String>,
}

impl ActionSpec {
    /// Creates an action with run order 1 and no inputs or output.
    #[must_use]
    pub fn new(id: impl Into<ActionId>, config: ActionConfig) -> Self {
        Self {
            id: id.into(),
            config,
            run_order: 1,
            inputs: Vec::new(),
            additional_inputs: Vec::new(),
            output: None,
        }
    }

    /// A repository source action.
    #[must_use]
    pub fn repository_source(
        id: impl Into<ActionId>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            ActionConfig::Source(SourceLocation::Repository {
                owner: owner.into(),
                repo: repo.into(),
                branch: branch.into(),
            }),
        )
    }

    /// An image-repository source action.
    #[must_use]
    pub fn image_source(
        id: impl Into<ActionId>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            ActionConfig::Source(SourceLocation::ImageRepository {
                repository: repository.into(),
                tag: tag.into(),
            }),
        )
    }

    /// A build action.
    #[must_use]
    pub fn build(id: impl Into<ActionId>, project: impl Into<String>) -> Self {
        Self::new(
            id,
            ActionConfig::Build {
                project: project.into(),
            },
        )
    }

    /// A manual approval action.
    #[must_use]
    pub fn approval(id: impl Into<ActionId>) -> Self {
        Self::new(id, ActionConfig::Approval { message: None })
    }

    /// A change-set planning action.
    #[must_use]
    pub fn create_change_set(
        id: impl Into<ActionId>,
        environment: Environment,
        change_set_name: impl Into<String>,
        template_path: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            ActionConfig::ChangeSetCreate {
                environment,
                change_set_name: change_set_name.into(),
                template_path: template_path.into(),
            },
        )
    }

    /// A change-set apply action.
    #[must_use]
    pub fn execute_change_set(
        id: impl Into<ActionId>,
        environment: Environment,
        change_set_name: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            ActionConfig::ChangeSetExecute {
                environment,
                change_set_name: change_set_name.into(),
            },
        )
    }

    /// Sets the run order.
    #[must_use]
    pub fn with_run_order(mut self, run_order: u32) -> Self {
        self.run_order = run_order;
        self
    }

    /// Appends a primary input.
    #[must_use]
    pub fn with_input(mut self, artifact: impl Into<String>) -> Self {
        self.inputs.push(artifact.into());
        self
    }

    /// Appends an additional input.
    #[must_use]
    pub fn with_additional_input(mut self, artifact: impl Into<String>) -> Self {
        self.additional_inputs.push(artifact.into());
        self
    }

    /// Sets the produced artifact.
    #[must_use]
    pub fn with_output(mut self, artifact: impl Into<String>) -> Self {
        self.output = Some(artifact.into());
        self
    }

    /// Sets the message shown to approvers. No-op for other kinds.
    #[must_use]
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        if let ActionConfig::Approval { message } = &mut self.config {
            *message = Some(text.into());
        }
        self
    }

    /// Returns the action kind.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        self.config.kind()
    }

    /// All inputs, primary first.
    pub fn all_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .chain(self.additional_inputs.iter())
            .map(String::as_str)
    }

    /// Returns true if the action plans or applies against production.
    #[must_use]
    pub fn affects_production(&self) -> bool {
        self.kind().targets_environment()
            && self
                .config
                .environment()
                .is_some_and(|env| env.kind.is_production())
    }
}

/// Specification of a stage: an ordered group of actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name.
    pub name: String,
    /// Actions in declaration order.
    pub actions: Vec<ActionSpec>,
}

impl StageSpec {
    /// Creates an empty stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    /// Appends an action.
    #[must_use]
    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    /// Distinct run orders, ascending.
    #[must_use]
    pub fn run_orders(&self) -> Vec<u32> {
        self.actions
            .iter()
            .map(|a| a.run_order)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// A validated pipeline. Build one with [`super::PipelineBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub(crate) name: String,
    pub(crate) stages: Vec<StageSpec>,
}

impl Pipeline {
    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Looks up an action by id.
    #[must_use]
    pub fn action(&self, id: &str) -> Option<&ActionSpec> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter())
            .find(|a| a.id.as_str() == id)
    }

    /// Total number of actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.stages.iter().map(|s| s.actions.len()).sum()
    }
}
