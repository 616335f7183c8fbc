//! Runs the backend service pipeline once against in-memory collaborators.
//!
//! Environment:
//! - `SHIPFLOW_APPROVE`: `yes` (default) or `no`, the decision on production promotion
//! - `SHIPFLOW_LOG_FORMAT`: `compact` (default) or `json`
//! - `GIT_REF`: the ref of the simulated push (default `master`)
//! - the variables of [`PipelineConfig::from_env`]

use anyhow::{bail, Context, Result};
use shipflow::approval::ApprovalService;
use shipflow::blueprints::{self, BACKEND_BUILD_PROJECT, BACKEND_STACK_PREFIX};
use shipflow::config::PipelineConfig;
use shipflow::deploy::{ChangeSetDeployer, EnvironmentKind};
use shipflow::events::{EventSink, LoggingEventSink};
use shipflow::executor::{Collaborators, PipelineExecutor};
use shipflow::observability::{init_tracing, LogFormat};
use shipflow::pipeline::SourceChange;
use shipflow::testing::{InMemoryEnvironment, ScriptedBuildRunner, StaticSourceProvider};
use shipflow::utils::short_digest;
use std::sync::Arc;
use tracing::{info, warn};

fn approve_from_env() -> Result<bool> {
    match std::env::var("SHIPFLOW_APPROVE")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "" | "yes" | "y" | "true" => Ok(true),
        "no" | "n" | "false" => Ok(false),
        other => bail!("SHIPFLOW_APPROVE must be 'yes' or 'no', got '{other}'"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let format: LogFormat = std::env::var("SHIPFLOW_LOG_FORMAT")
        .unwrap_or_default()
        .parse()
        .map_err(anyhow::Error::msg)?;
    init_tracing(format);

    let approve = approve_from_env()?;
    let config = PipelineConfig::from_env();
    let pipeline = Arc::new(
        blueprints::api_service(&config).context("invalid pipeline configuration")?,
    );

    let sink: Arc<dyn EventSink> = Arc::new(LoggingEventSink::info());
    let environment = Arc::new(InMemoryEnvironment::new());
    let approvals = Arc::new(ApprovalService::new());
    let collaborators = Collaborators {
        source: Arc::new(StaticSourceProvider::new()),
        builds: Arc::new(ScriptedBuildRunner::new().rendering_backend(
            BACKEND_BUILD_PROJECT,
            config.clone(),
            BACKEND_STACK_PREFIX,
        )),
        deployer: Arc::new(
            ChangeSetDeployer::new(environment.clone()).with_event_sink(Arc::clone(&sink)),
        ),
        approvals: approvals.clone(),
    };
    let executor = PipelineExecutor::new(collaborators).with_event_sink(sink);

    let approver = {
        let approvals = Arc::clone(&approvals);
        tokio::spawn(async move {
            loop {
                for request in approvals.wait_for_pending().await {
                    info!(
                        stage = %request.stage,
                        action = %request.action,
                        message = request.message.as_deref().unwrap_or(""),
                        approve,
                        "Deciding approval"
                    );
                    if let Err(err) = approvals.resolve(request.token, approve) {
                        warn!(error = %err, "Approval decision not delivered");
                    }
                }
            }
        })
    };

    let git_ref = std::env::var("GIT_REF").unwrap_or_else(|_| "master".to_string());
    let trigger = SourceChange::new(&config.repo_owner, &config.repo_name, git_ref);
    let run = executor.run(pipeline, trigger).await?;
    approver.abort();

    for stage in run.stages() {
        info!(stage = stage.name(), status = %stage.status(), "Stage result");
    }
    for kind in [EnvironmentKind::Test, EnvironmentKind::Prod] {
        let stack = format!("{BACKEND_STACK_PREFIX}{}", kind.suffix());
        let digest = environment.deployed_digest(&stack);
        info!(
            stack = %stack,
            version = environment.version(&stack),
            template = digest.as_deref().map_or("-", short_digest),
            "Environment state"
        );
    }

    if let Some(failure) = run.first_failure() {
        bail!(
            "run {} failed at {}/{}: {}",
            run.run_id(),
            failure.stage,
            failure.action,
            failure.message
        );
    }
    info!(run_id = %run.run_id(), status = %run.status(), "Run finished");
    Ok(())
}
