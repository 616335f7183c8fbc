//! Async execution of pipeline runs.
//!
//! The [`PipelineRun`](crate::pipeline::PipelineRun) state machine decides
//! what may run; [`PipelineExecutor`] performs the dispatched actions through
//! the [`Collaborators`] and feeds their results back.

mod collaborators;
mod engine;

#[cfg(test)]
mod executor_tests;

pub use collaborators::{BuildRequest, BuildRunner, Collaborators, SourceProvider};
pub use engine::PipelineExecutor;
