//! Testing utilities for shipflow pipelines.
//!
//! This module provides:
//! - An in-memory, versioned environment backend
//! - Scripted source and build collaborators
//! - A harness wiring them into an executor
//! - Assertions over runs

mod assertions;
mod environment;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_action_status, assert_halted_after, assert_run_failed_at, assert_run_status,
    assert_stage_status,
};
pub use environment::{InMemoryEnvironment, ARTIFACT_RESOURCE, TEMPLATE_RESOURCE};
pub use fixtures::TestHarness;
pub use mocks::{ScriptedBuildRunner, StaticSourceProvider};
