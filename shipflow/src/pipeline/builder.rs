//! Pipeline builder with validation.

use super::{ActionConfig, ActionSpec, Pipeline, StageSpec};
use crate::core::ActionKind;
use crate::errors::PipelineValidationError;
use std::collections::HashSet;

/// Builder for creating validated pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// Stages in execution order.
    stages: Vec<StageSpec>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends an action to an existing stage, or to a new stage at the end.
    #[must_use]
    pub fn action(mut self, stage: &str, action: ActionSpec) -> Self {
        match self.stages.iter_mut().find(|s| s.name == stage) {
            Some(existing) => existing.actions.push(action),
            None => self.stages.push(StageSpec::new(stage).with_action(action)),
        }
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineValidationError`] if the pipeline is empty, a
    /// stage is empty, names are duplicated, a run order is zero, a change
    /// set is executed without being planned first in the same stage, a
    /// change-set plan has no input, or a production-affecting action is not
    /// gated by an earlier approval.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "PIPELINE-NAME",
                "Pipeline name cannot be empty or whitespace-only",
            ));
        }

        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("PIPELINE-EMPTY", "Pipeline has no stages")
                .with_subjects(vec![self.name.clone()])
                .with_fix_hint("Add at least one stage to the pipeline before building."));
        }

        let mut stage_names = HashSet::new();
        let mut action_ids = HashSet::new();

        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(PipelineValidationError::new(
                    "PIPELINE-DUPLICATE",
                    format!("Duplicate stage name '{}'", stage.name),
                )
                .with_subjects(vec![stage.name.clone()]));
            }

            if stage.actions.is_empty() {
                return Err(PipelineValidationError::new(
                    "PIPELINE-EMPTY-STAGE",
                    format!("Stage '{}' has no actions", stage.name),
                )
                .with_subjects(vec![stage.name.clone()])
                .with_fix_hint("Remove the stage or add an action to it."));
            }

            for action in &stage.actions {
                if !action_ids.insert(action.id.as_str()) {
                    return Err(PipelineValidationError::new(
                        "PIPELINE-DUPLICATE",
                        format!("Duplicate action name '{}'", action.id),
                    )
                    .with_subjects(vec![stage.name.clone(), action.id.to_string()])
                    .with_fix_hint("Action names must be unique across the whole pipeline."));
                }

                if action.run_order == 0 {
                    return Err(PipelineValidationError::new(
                        "PIPELINE-RUN-ORDER",
                        format!("Action '{}' has run order 0", action.id),
                    )
                    .with_subjects(vec![stage.name.clone(), action.id.to_string()])
                    .with_fix_hint("Run orders start at 1."));
                }
            }

            validate_change_sets(stage)?;
            validate_approval_gate(stage)?;
        }

        Ok(Pipeline {
            name: self.name,
            stages: self.stages,
        })
    }
}

/// Every execute needs a plan for the same stack and name in a lower group.
fn validate_change_sets(stage: &StageSpec) -> Result<(), PipelineValidationError> {
    for action in &stage.actions {
        match &action.config {
            ActionConfig::ChangeSetCreate { .. } if action.inputs.is_empty() => {
                return Err(PipelineValidationError::new(
                    "PIPELINE-CHANGESET-INPUT",
                    format!("Change-set plan '{}' declares no template artifact", action.id),
                )
                .with_subjects(vec![stage.name.clone(), action.id.to_string()])
                .with_fix_hint("Add the build output carrying the template as the first input."));
            }
            ActionConfig::ChangeSetExecute { .. } => {
                let key = action.config.change_set_key();
                let planned = stage.actions.iter().any(|other| {
                    other.kind() == ActionKind::ChangeSetCreate
                        && other.run_order < action.run_order
                        && other.config.change_set_key() == key
                });
                if !planned {
                    return Err(PipelineValidationError::new(
                        "PIPELINE-CHANGESET-ORDER",
                        format!(
                            "Change-set execute '{}' has no earlier create for the same stack and name",
                            action.id
                        ),
                    )
                    .with_subjects(vec![stage.name.clone(), action.id.to_string()])
                    .with_fix_hint(
                        "Add a create action with the same stack and change-set name and a lower run order.",
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Production-affecting actions need an approval in an earlier group of
/// their own stage.
fn validate_approval_gate(stage: &StageSpec) -> Result<(), PipelineValidationError> {
    let first_approval = stage
        .actions
        .iter()
        .filter(|a| a.kind() == ActionKind::Approval)
        .map(|a| a.run_order)
        .min();

    for action in stage.actions.iter().filter(|a| a.affects_production()) {
        let gated = first_approval.is_some_and(|order| order < action.run_order);
        if !gated {
            return Err(PipelineValidationError::new(
                "PIPELINE-UNGATED-PROD",
                format!(
                    "Action '{}' affects production without a preceding approval",
                    action.id
                ),
            )
            .with_subjects(vec![stage.name.clone(), action.id.to_string()])
            .with_fix_hint("Add an approval action to the same stage with a lower run order."));
        }
    }

    Ok(())
}
