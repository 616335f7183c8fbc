//! Assertions over pipeline runs.

use crate::core::{ActionStatus, RunStatus, StageStatus};
use crate::pipeline::PipelineRun;

/// Asserts the run's terminal or current status.
pub fn assert_run_status(run: &PipelineRun, expected: RunStatus) {
    assert_eq!(
        run.status(),
        expected,
        "Expected run status {expected}, got {} (failure: {:?})",
        run.status(),
        run.first_failure()
    );
}

/// Asserts that a stage has the expected status.
pub fn assert_stage_status(run: &PipelineRun, stage: &str, expected: StageStatus) {
    assert_eq!(
        run.stage_status(stage),
        Some(expected),
        "Expected stage '{stage}' to be {expected}"
    );
}

/// Asserts that an action's current attempt has the expected status.
pub fn assert_action_status(run: &PipelineRun, action: &str, expected: ActionStatus) {
    assert_eq!(
        run.action_status(action),
        Some(expected),
        "Expected action '{action}' to be {expected}"
    );
}

/// Asserts that the run failed with its first failure at `stage`/`action` and error `code`.
pub fn assert_run_failed_at(run: &PipelineRun, stage: &str, action: &str, code: &str) {
    assert_run_status(run, RunStatus::Failed);
    let failure = run
        .first_failure()
        .unwrap_or_else(|| panic!("Failed run has no recorded failure"));
    assert_eq!(
        (failure.stage.as_str(), failure.action.as_str(), failure.code.as_str()),
        (stage, action, code),
        "Unexpected first failure: {}",
        failure.message
    );
}

/// Asserts that no stage after `stage` has started.
pub fn assert_halted_after(run: &PipelineRun, stage: &str) {
    let stages = run.stages();
    let position = stages
        .iter()
        .position(|s| s.name() == stage)
        .unwrap_or_else(|| panic!("Unknown stage '{stage}'"));
    for later in &stages[position + 1..] {
        assert_eq!(
            later.status(),
            StageStatus::NotStarted,
            "Stage '{}' started after '{stage}'",
            later.name()
        );
    }
}
