//! Pipeline definitions and the run state machine.
//!
//! This module provides:
//! - Pipeline, stage and action specifications
//! - A builder that validates definitions
//! - Run-scoped artifact resolution
//! - [`PipelineRun`], the event-driven state machine

mod builder;
mod resolver;
mod run;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use resolver::ArtifactStore;
pub use run::{ActionAttempt, ActionState, Dispatch, PipelineRun, RunEvent, StageState, Ticket};
pub use spec::{ActionConfig, ActionSpec, Pipeline, SourceChange, SourceLocation, StageSpec};
