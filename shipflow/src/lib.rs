//! # Shipflow
//!
//! A multi-stage continuous-delivery pipeline orchestrator.
//!
//! Shipflow models delivery as a strictly ordered series of stages, each an
//! ordered set of actions grouped by run order. It provides:
//!
//! - **A run state machine**: stages and action groups gate each other; the
//!   first failure halts promotion
//! - **Run-scoped artifacts**: immutable, named outputs resolved per run
//! - **Two-phase deployments**: change sets are planned read-only and
//!   applied separately, with staleness detection
//! - **Manual approval gates**: production promotion waits for a human
//! - **Event-driven observability**: lifecycle events for every transition
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shipflow::prelude::*;
//!
//! let config = PipelineConfig::from_env();
//! let pipeline = Arc::new(blueprints::api_service(&config)?);
//!
//! let executor = PipelineExecutor::new(collaborators);
//! let run = executor
//!     .run(pipeline, SourceChange::new("aws-samples", "trivia", "master"))
//!     .await?;
//! assert!(run.status().is_terminal());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod approval;
pub mod blueprints;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod executor;
pub mod observability;
pub mod pipeline;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalService, PendingToken};
    pub use crate::blueprints;
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{PipelineConfig, ServiceConfig};
    pub use crate::core::{
        ActionId, ActionKind, ActionStatus, Artifact, ArtifactPayload, ArtifactRef, RunStatus,
        StageStatus,
    };
    pub use crate::deploy::{
        ChangeSet, ChangeSetDeployer, ChangeSetStatus, Environment, EnvironmentBackend,
        EnvironmentKind,
    };
    pub use crate::errors::{ConfigError, PipelineValidationError, ShipflowError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{BuildRunner, Collaborators, PipelineExecutor, SourceProvider};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        ActionSpec, Pipeline, PipelineBuilder, PipelineRun, RunEvent, SourceChange, StageSpec,
    };
    pub use crate::utils::{iso_timestamp, Timestamp};
    pub use std::sync::Arc;
}
