//! Core domain model types for shipflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Action, stage and run status enums
//! - Artifacts and action identifiers
//! - Lifecycle events

mod artifact;
mod event;
mod status;

pub use artifact::{ActionId, Artifact, ArtifactPayload, ArtifactRef};
pub use event::LifecycleEvent;
pub use status::{ActionKind, ActionStatus, RunStatus, StageStatus};
