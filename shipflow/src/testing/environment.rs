//! In-memory environment backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::deploy::{
    ApplyResult, ChangeSet, EnvironmentBackend, StackDiff, StateSnapshot, TemplateRef,
};
use crate::errors::ShipflowError;

/// Resource holding the digest of the deployed template.
pub const TEMPLATE_RESOURCE: &str = "Template";
/// Resource holding the location of the deployed build artifact.
pub const ARTIFACT_RESOURCE: &str = "Artifact";

#[derive(Debug, Default, Clone)]
struct Stack {
    version: u64,
    resources: BTreeMap<String, String>,
}

/// A versioned, in-process stand-in for real stacks.
///
/// A template deploys as two resources: its digest and its artifact
/// location. Every mutation bumps the stack version, so any out-of-band
/// change makes earlier plans stale.
#[derive(Debug, Default)]
pub struct InMemoryEnvironment {
    stacks: Mutex<HashMap<String, Stack>>,
    scheduled_drift: Mutex<HashMap<String, (String, String)>>,
    applies: AtomicUsize,
}

impl InMemoryEnvironment {
    /// Creates an environment with no stacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a stack (0 if never deployed).
    #[must_use]
    pub fn version(&self, stack_name: &str) -> u64 {
        self.stacks
            .lock()
            .get(stack_name)
            .map_or(0, |stack| stack.version)
    }

    /// Digest of the template deployed on a stack.
    #[must_use]
    pub fn deployed_digest(&self, stack_name: &str) -> Option<String> {
        self.resource(stack_name, TEMPLATE_RESOURCE)
    }

    /// Location of the artifact deployed on a stack.
    #[must_use]
    pub fn deployed_artifact(&self, stack_name: &str) -> Option<String> {
        self.resource(stack_name, ARTIFACT_RESOURCE)
    }

    /// Snapshot of a stack.
    #[must_use]
    pub fn snapshot(&self, stack_name: &str) -> StateSnapshot {
        match self.stacks.lock().get(stack_name) {
            Some(stack) => StateSnapshot {
                stack_name: stack_name.to_string(),
                version: stack.version,
                resources: stack.resources.clone(),
            },
            None => StateSnapshot::empty(stack_name),
        }
    }

    /// Mutates a stack out of band, as a manual console edit would.
    pub fn drift(&self, stack_name: &str, resource: &str, value: &str) {
        let mut stacks = self.stacks.lock();
        let stack = stacks.entry(stack_name.to_string()).or_default();
        stack.resources.insert(resource.to_string(), value.to_string());
        stack.version += 1;
    }

    /// Arranges for [`Self::drift`] to happen right before the next apply on `stack_name`.
    pub fn drift_before_next_apply(&self, stack_name: &str, resource: &str, value: &str) {
        self.scheduled_drift.lock().insert(
            stack_name.to_string(),
            (resource.to_string(), value.to_string()),
        );
    }

    /// Number of apply calls received, including rejected ones.
    #[must_use]
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn resource(&self, stack_name: &str, resource: &str) -> Option<String> {
        self.stacks
            .lock()
            .get(stack_name)
            .and_then(|stack| stack.resources.get(resource).cloned())
    }
}

fn desired_resources(template: &TemplateRef) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TEMPLATE_RESOURCE.to_string(), template.digest.clone()),
        (ARTIFACT_RESOURCE.to_string(), template.location.clone()),
    ])
}

#[async_trait]
impl EnvironmentBackend for InMemoryEnvironment {
    async fn current_state(&self, stack_name: &str) -> Result<StateSnapshot, ShipflowError> {
        Ok(self.snapshot(stack_name))
    }

    async fn diff(
        &self,
        snapshot: &StateSnapshot,
        desired: &TemplateRef,
    ) -> Result<StackDiff, ShipflowError> {
        Ok(StackDiff::between(&snapshot.resources, &desired_resources(desired)))
    }

    async fn apply(&self, change_set: &ChangeSet) -> Result<ApplyResult, ShipflowError> {
        self.applies.fetch_add(1, Ordering::SeqCst);

        let drift = self.scheduled_drift.lock().remove(&change_set.target_stack);
        if let Some((resource, value)) = drift {
            self.drift(&change_set.target_stack, &resource, &value);
        }

        let mut stacks = self.stacks.lock();
        let stack = stacks.entry(change_set.target_stack.clone()).or_default();
        if stack.version != change_set.base_version {
            return Err(ShipflowError::stale_change_set(
                &change_set.target_stack,
                &change_set.name,
            ));
        }

        change_set.diff.apply_to(&mut stack.resources);
        stack.version += 1;
        Ok(ApplyResult {
            stack_name: change_set.target_stack.clone(),
            change_set: change_set.name.clone(),
            new_version: stack.version,
            applied_changes: change_set.diff.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{ChangeSetStatus, EnvironmentKind};

    fn template(digest: &str) -> TemplateRef {
        TemplateRef {
            artifact: "Build".to_string(),
            location: "mem://build".to_string(),
            path: "AppTest.template.json".to_string(),
            digest: digest.to_string(),
        }
    }

    async fn planned(env: &InMemoryEnvironment, digest: &str) -> ChangeSet {
        let snapshot = env.current_state("AppTest").await.unwrap();
        let mut change_set =
            ChangeSet::pending("Staged", "AppTest", EnvironmentKind::Test, template(digest));
        change_set.diff = env.diff(&snapshot, &change_set.template).await.unwrap();
        change_set.base_version = snapshot.version;
        change_set.status = ChangeSetStatus::Ready;
        change_set
    }

    #[tokio::test]
    async fn test_apply_deploys_template_and_artifact() {
        let env = InMemoryEnvironment::new();
        let change_set = planned(&env, "d1").await;
        assert_eq!(change_set.diff.len(), 2);

        let result = env.apply(&change_set).await.unwrap();
        assert_eq!(result.new_version, 1);
        assert_eq!(env.deployed_digest("AppTest").as_deref(), Some("d1"));
        assert_eq!(env.deployed_artifact("AppTest").as_deref(), Some("mem://build"));
    }

    #[tokio::test]
    async fn test_unchanged_template_plans_empty_diff() {
        let env = InMemoryEnvironment::new();
        env.apply(&planned(&env, "d1").await).await.unwrap();
        assert!(planned(&env, "d1").await.diff.is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_drift_makes_apply_stale() {
        let env = InMemoryEnvironment::new();
        let change_set = planned(&env, "d1").await;
        env.drift_before_next_apply("AppTest", "ManualEdit", "x");

        let err = env.apply(&change_set).await.unwrap_err();
        assert!(err.is_retryable_by_replan());
        assert_eq!(env.deployed_digest("AppTest"), None);
        assert_eq!(env.version("AppTest"), 1);
        assert_eq!(env.apply_count(), 1);

        // Drift fires once.
        env.apply(&planned(&env, "d1").await).await.unwrap();
        assert_eq!(env.deployed_digest("AppTest").as_deref(), Some("d1"));
    }
}
