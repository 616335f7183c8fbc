//! Two-phase (plan, then apply) deployment protocol.

use super::{
    ApplyResult, ChangeSet, ChangeSetStatus, Environment, EnvironmentBackend, TemplateRef,
};
use crate::core::LifecycleEvent;
use crate::errors::ShipflowError;
use crate::events::{EventSink, NoOpEventSink};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry key: one live change set per (stack, name).
type ChangeSetKey = (String, String);

/// Plans and applies change sets against environment backends.
///
/// At most one change set exists per (stack, name); creating again replaces
/// it. Applies against the same stack are serialized.
pub struct ChangeSetDeployer {
    backend: Arc<dyn EnvironmentBackend>,
    change_sets: DashMap<ChangeSetKey, ChangeSet>,
    apply_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    sink: Arc<dyn EventSink>,
}

impl ChangeSetDeployer {
    /// Creates a deployer over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn EnvironmentBackend>) -> Self {
        Self {
            backend,
            change_sets: DashMap::new(),
            apply_locks: DashMap::new(),
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the sink receiving `changeset.*` events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Plans a change set against `environment` (create-or-replace).
    ///
    /// Read-only with respect to the environment. Any previous change set of
    /// the same name on the same stack is superseded.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the state cannot be read or diffed; the
    /// registered change set is then marked `Failed`.
    pub async fn create_change_set(
        &self,
        environment: &Environment,
        name: &str,
        template: TemplateRef,
    ) -> Result<ChangeSet, ShipflowError> {
        let key = (environment.stack_name.clone(), name.to_string());
        let mut change_set =
            ChangeSet::pending(name, &environment.stack_name, environment.kind, template);
        let id = change_set.id;

        if let Some(previous) = self.change_sets.insert(key.clone(), change_set.clone()) {
            debug!(
                stack = %environment.stack_name,
                change_set = name,
                previous_id = %previous.id,
                previous_status = %previous.status,
                "Replacing existing change set"
            );
        }

        let planned = async {
            let snapshot = self.backend.current_state(&environment.stack_name).await?;
            let diff = self.backend.diff(&snapshot, &change_set.template).await?;
            Ok::<_, ShipflowError>((snapshot.version, diff))
        }
        .await;

        match planned {
            Ok((base_version, diff)) => {
                change_set.base_version = base_version;
                change_set.diff = diff;
                change_set.status = ChangeSetStatus::Ready;
            }
            Err(err) => {
                change_set.status = ChangeSetStatus::Failed;
                self.store_if_current(&key, id, &change_set);
                warn!(stack = %environment.stack_name, change_set = name, error = %err, "Change set planning failed");
                LifecycleEvent::new("changeset.failed")
                    .add_data("stack", serde_json::json!(environment.stack_name))
                    .add_data("change_set", serde_json::json!(name))
                    .add_data("error", serde_json::json!(err.to_string()))
                    .emit_to(self.sink.as_ref());
                return Err(err);
            }
        }

        if !self.store_if_current(&key, id, &change_set) {
            return Err(ShipflowError::InvalidTransition(format!(
                "change set '{name}' on '{}' was superseded while planning",
                environment.stack_name
            )));
        }

        info!(
            stack = %environment.stack_name,
            change_set = name,
            changes = change_set.diff.len(),
            base_version = change_set.base_version,
            "Change set ready"
        );
        LifecycleEvent::new("changeset.created")
            .add_data("stack", serde_json::json!(environment.stack_name))
            .add_data("change_set", serde_json::json!(name))
            .add_data("id", serde_json::json!(id.to_string()))
            .add_data("changes", serde_json::json!(change_set.diff.len()))
            .emit_to(self.sink.as_ref());

        Ok(change_set)
    }

    /// Applies the registered change set `name` on `stack_name`.
    ///
    /// # Errors
    ///
    /// `ChangeSetNotFound` if it was never created, `ChangeSetNotReady` if it
    /// is not `Ready`, `StaleChangeSet` if the environment diverged since
    /// planning. None of these are retried.
    pub async fn execute_named(
        &self,
        stack_name: &str,
        name: &str,
    ) -> Result<ApplyResult, ShipflowError> {
        self.execute_inner(stack_name, name, None).await
    }

    /// Applies `change_set`, which must still be the registered plan for its name.
    ///
    /// # Errors
    ///
    /// As [`Self::execute_named`]; additionally `ChangeSetNotReady` if the
    /// given plan has been superseded by a newer one.
    pub async fn execute_change_set(
        &self,
        change_set: &ChangeSet,
    ) -> Result<ApplyResult, ShipflowError> {
        self.execute_inner(&change_set.target_stack, &change_set.name, Some(change_set.id))
            .await
    }

    /// Applies plan `id` of change set `name` on `stack_name`.
    ///
    /// # Errors
    ///
    /// As [`Self::execute_change_set`].
    pub async fn execute_planned(
        &self,
        stack_name: &str,
        name: &str,
        id: Uuid,
    ) -> Result<ApplyResult, ShipflowError> {
        self.execute_inner(stack_name, name, Some(id)).await
    }

    async fn execute_inner(
        &self,
        stack_name: &str,
        name: &str,
        expected: Option<Uuid>,
    ) -> Result<ApplyResult, ShipflowError> {
        let lock = self
            .apply_locks
            .entry(stack_name.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let key = (stack_name.to_string(), name.to_string());
        let current = self
            .change_sets
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ShipflowError::ChangeSetNotFound {
                stack: stack_name.to_string(),
                change_set: name.to_string(),
            })?;

        if let Some(expected) = expected {
            if expected != current.id {
                warn!(
                    stack = stack_name,
                    change_set = name,
                    expected = %expected,
                    current = %current.id,
                    "Refusing to apply a superseded plan"
                );
                return Err(ShipflowError::ChangeSetNotReady {
                    stack: stack_name.to_string(),
                    change_set: name.to_string(),
                    status: "superseded".to_string(),
                });
            }
        }

        if !current.is_ready() {
            return Err(ShipflowError::ChangeSetNotReady {
                stack: stack_name.to_string(),
                change_set: name.to_string(),
                status: current.status.to_string(),
            });
        }

        match self.backend.apply(&current).await {
            Ok(result) => {
                self.set_status(&key, current.id, ChangeSetStatus::Executed);
                info!(
                    stack = stack_name,
                    change_set = name,
                    new_version = result.new_version,
                    applied = result.applied_changes,
                    "Change set executed"
                );
                LifecycleEvent::new("changeset.executed")
                    .add_data("stack", serde_json::json!(stack_name))
                    .add_data("change_set", serde_json::json!(name))
                    .add_data("new_version", serde_json::json!(result.new_version))
                    .emit_to(self.sink.as_ref());
                Ok(result)
            }
            Err(err) => {
                self.set_status(&key, current.id, ChangeSetStatus::Failed);
                warn!(stack = stack_name, change_set = name, error = %err, "Change set execution failed");
                LifecycleEvent::new("changeset.failed")
                    .add_data("stack", serde_json::json!(stack_name))
                    .add_data("change_set", serde_json::json!(name))
                    .add_data("error", serde_json::json!(err.to_string()))
                    .emit_to(self.sink.as_ref());
                Err(err)
            }
        }
    }

    /// Returns the registered change set for (stack, name).
    #[must_use]
    pub fn get(&self, stack_name: &str, name: &str) -> Option<ChangeSet> {
        self.change_sets
            .get(&(stack_name.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Returns the number of change sets not yet executed or failed.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.change_sets
            .iter()
            .filter(|entry| {
                matches!(
                    entry.value().status,
                    ChangeSetStatus::Pending | ChangeSetStatus::Ready
                )
            })
            .count()
    }

    fn store_if_current(&self, key: &ChangeSetKey, id: Uuid, change_set: &ChangeSet) -> bool {
        match self.change_sets.get_mut(key) {
            Some(mut entry) if entry.id == id => {
                *entry = change_set.clone();
                true
            }
            _ => false,
        }
    }

    fn set_status(&self, key: &ChangeSetKey, id: Uuid, status: ChangeSetStatus) {
        if let Some(mut entry) = self.change_sets.get_mut(key) {
            if entry.id == id {
                entry.status = status;
            }
        }
    }
}

impl std::fmt::Debug for ChangeSetDeployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSetDeployer")
            .field("change_sets", &self.change_sets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{EnvironmentKind, MockEnvironmentBackend, StackDiff, StateSnapshot};
    use crate::events::CollectingEventSink;
    use crate::testing::InMemoryEnvironment;
    use pretty_assertions::assert_eq;

    fn test_env() -> Environment {
        Environment::new(EnvironmentKind::Test, "AppTest", "api-test.example.com").unwrap()
    }

    fn template(digest: &str) -> TemplateRef {
        TemplateRef {
            artifact: "Build".to_string(),
            location: "mem://build/1".to_string(),
            path: "AppTest.template.json".to_string(),
            digest: digest.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_is_read_only() {
        let backend = Arc::new(InMemoryEnvironment::new());
        let deployer = ChangeSetDeployer::new(backend.clone());

        let change_set = deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();

        assert_eq!(change_set.status, ChangeSetStatus::Ready);
        assert!(!change_set.diff.is_empty());
        assert_eq!(backend.deployed_digest("AppTest"), None);
        assert_eq!(backend.version("AppTest"), 0);
    }

    #[tokio::test]
    async fn test_create_twice_replaces_pending() {
        let backend = Arc::new(InMemoryEnvironment::new());
        let deployer = ChangeSetDeployer::new(backend);

        let first = deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();
        let second = deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(deployer.open_count(), 1);
        assert_eq!(deployer.get("AppTest", "Staged").unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_execute_applies_plan() {
        let backend = Arc::new(InMemoryEnvironment::new());
        let sink = Arc::new(CollectingEventSink::new());
        let deployer = ChangeSetDeployer::new(backend.clone()).with_event_sink(sink.clone());

        deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();
        let result = deployer.execute_named("AppTest", "Staged").await.unwrap();

        assert_eq!(result.new_version, 1);
        assert_eq!(backend.deployed_digest("AppTest").as_deref(), Some("t1"));
        assert_eq!(
            deployer.get("AppTest", "Staged").unwrap().status,
            ChangeSetStatus::Executed
        );
        assert_eq!(sink.event_types(), vec!["changeset.created", "changeset.executed"]);
    }

    #[tokio::test]
    async fn test_execute_without_create_fails() {
        let deployer = ChangeSetDeployer::new(Arc::new(InMemoryEnvironment::new()));

        let err = deployer.execute_named("AppTest", "Staged").await.unwrap_err();
        assert_eq!(err.code(), "change-set-not-found");
    }

    #[tokio::test]
    async fn test_execute_twice_is_rejected() {
        let deployer = ChangeSetDeployer::new(Arc::new(InMemoryEnvironment::new()));
        deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();
        deployer.execute_named("AppTest", "Staged").await.unwrap();

        let err = deployer.execute_named("AppTest", "Staged").await.unwrap_err();
        assert!(matches!(
            err,
            ShipflowError::ChangeSetNotReady { ref status, .. } if status == "executed"
        ));
    }

    #[tokio::test]
    async fn test_superseded_plan_cannot_execute() {
        let deployer = ChangeSetDeployer::new(Arc::new(InMemoryEnvironment::new()));
        let first = deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();
        deployer
            .create_change_set(&test_env(), "Staged", template("t2"))
            .await
            .unwrap();

        let err = deployer.execute_change_set(&first).await.unwrap_err();
        assert_eq!(err.code(), "change-set-not-ready");
    }

    #[tokio::test]
    async fn test_execute_planned_applies_only_its_own_plan() {
        let backend = Arc::new(InMemoryEnvironment::new());
        let deployer = ChangeSetDeployer::new(backend.clone());
        let first = deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();
        let second = deployer
            .create_change_set(&test_env(), "Staged", template("t2"))
            .await
            .unwrap();

        let err = deployer
            .execute_planned("AppTest", "Staged", first.id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShipflowError::ChangeSetNotReady { ref status, .. } if status == "superseded"
        ));
        assert_eq!(backend.deployed_digest("AppTest"), None);

        deployer
            .execute_planned("AppTest", "Staged", second.id)
            .await
            .unwrap();
        assert_eq!(backend.deployed_digest("AppTest").as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_stale_change_set_leaves_environment_unchanged() {
        let backend = Arc::new(InMemoryEnvironment::new());
        let deployer = ChangeSetDeployer::new(backend.clone());

        deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();
        backend.drift("AppTest", "ManualEdit", "out-of-band");

        let err = deployer.execute_named("AppTest", "Staged").await.unwrap_err();
        assert!(err.is_retryable_by_replan());
        assert_eq!(backend.deployed_digest("AppTest"), None);
        assert_eq!(
            deployer.get("AppTest", "Staged").unwrap().status,
            ChangeSetStatus::Failed
        );

        // Re-planning against the drifted state succeeds.
        let fresh = deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();
        assert_eq!(fresh.base_version, 1);
        deployer.execute_named("AppTest", "Staged").await.unwrap();
        assert_eq!(backend.deployed_digest("AppTest").as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_planning_failure_marks_change_set_failed() {
        let mut backend = MockEnvironmentBackend::new();
        backend
            .expect_current_state()
            .returning(|stack| Ok(StateSnapshot::empty(stack)));
        backend
            .expect_diff()
            .returning(|_, _| Err(ShipflowError::Backend("template unreadable".to_string())));
        backend.expect_apply().never();

        let deployer = ChangeSetDeployer::new(Arc::new(backend));
        let err = deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "backend");
        assert_eq!(
            deployer.get("AppTest", "Staged").unwrap().status,
            ChangeSetStatus::Failed
        );
        let err = deployer.execute_named("AppTest", "Staged").await.unwrap_err();
        assert_eq!(err.code(), "change-set-not-ready");
    }

    #[tokio::test]
    async fn test_apply_receives_planned_diff() {
        let mut backend = MockEnvironmentBackend::new();
        backend
            .expect_current_state()
            .returning(|stack| Ok(StateSnapshot::empty(stack)));
        backend.expect_diff().returning(|_, desired| {
            let mut resources = std::collections::BTreeMap::new();
            resources.insert("Template".to_string(), desired.digest.clone());
            Ok(StackDiff::between(&std::collections::BTreeMap::new(), &resources))
        });
        backend
            .expect_apply()
            .withf(|cs| cs.diff.len() == 1 && cs.base_version == 0)
            .times(1)
            .returning(|cs| {
                Ok(ApplyResult {
                    stack_name: cs.target_stack.clone(),
                    change_set: cs.name.clone(),
                    new_version: 1,
                    applied_changes: cs.diff.len(),
                })
            });

        let deployer = ChangeSetDeployer::new(Arc::new(backend));
        deployer
            .create_change_set(&test_env(), "Staged", template("t1"))
            .await
            .unwrap();
        let result = deployer.execute_named("AppTest", "Staged").await.unwrap();
        assert_eq!(result.applied_changes, 1);
    }
}
