//! Lifecycle events emitted on every action, stage and run transition.

use crate::events::EventSink;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An observable event describing one state transition.
///
/// The executor keeps no memory of past runs; these events are the only
/// trace a run leaves for external logging and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// The event type (e.g., "action.started", "stage.failed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl LifecycleEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the payload as a JSON object, including the timestamp.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        let mut map: serde_json::Map<String, serde_json::Value> =
            self.data.clone().into_iter().collect();
        map.insert("timestamp".to_string(), serde_json::json!(self.timestamp));
        serde_json::Value::Object(map)
    }

    /// Hands the event to a sink without blocking.
    pub fn emit_to(&self, sink: &dyn EventSink) {
        sink.try_emit(&self.event_type, Some(self.payload()));
    }

    /// Creates an "action.started" event.
    #[must_use]
    pub fn action_started(stage: &str, action: &str, attempt: u32) -> Self {
        Self::new("action.started")
            .add_data("stage", serde_json::json!(stage))
            .add_data("action", serde_json::json!(action))
            .add_data("attempt", serde_json::json!(attempt))
    }

    /// Creates an "action.succeeded" event.
    #[must_use]
    pub fn action_succeeded(stage: &str, action: &str, attempt: u32) -> Self {
        Self::new("action.succeeded")
            .add_data("stage", serde_json::json!(stage))
            .add_data("action", serde_json::json!(action))
            .add_data("attempt", serde_json::json!(attempt))
    }

    /// Creates an "action.failed" event.
    #[must_use]
    pub fn action_failed(stage: &str, action: &str, attempt: u32, code: &str, error: &str) -> Self {
        Self::new("action.failed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("action", serde_json::json!(action))
            .add_data("attempt", serde_json::json!(attempt))
            .add_data("code", serde_json::json!(code))
            .add_data("error", serde_json::json!(error))
    }

    /// Creates an "action.cancelled" event.
    #[must_use]
    pub fn action_cancelled(stage: &str, action: &str, attempt: u32, reason: &str) -> Self {
        Self::new("action.cancelled")
            .add_data("stage", serde_json::json!(stage))
            .add_data("action", serde_json::json!(action))
            .add_data("attempt", serde_json::json!(attempt))
            .add_data("reason", serde_json::json!(reason))
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn stage_started(stage: &str) -> Self {
        Self::new("stage.started").add_data("stage", serde_json::json!(stage))
    }

    /// Creates a "stage.succeeded" event.
    #[must_use]
    pub fn stage_succeeded(stage: &str) -> Self {
        Self::new("stage.succeeded").add_data("stage", serde_json::json!(stage))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn stage_failed(stage: &str, action: &str) -> Self {
        Self::new("stage.failed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("failed_action", serde_json::json!(action))
    }

    /// Creates an "artifact.published" event.
    #[must_use]
    pub fn artifact_published(name: &str, produced_by: &str, location: &str) -> Self {
        Self::new("artifact.published")
            .add_data("artifact", serde_json::json!(name))
            .add_data("produced_by", serde_json::json!(produced_by))
            .add_data("location", serde_json::json!(location))
    }

    /// Attaches run correlation fields.
    #[must_use]
    pub fn for_run(self, pipeline: &str, run_id: &uuid::Uuid) -> Self {
        self.add_data("pipeline", serde_json::json!(pipeline))
            .add_data("run_id", serde_json::json!(run_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;

    #[test]
    fn test_event_creation() {
        let event = LifecycleEvent::new("test.event");
        assert_eq!(event.event_type, "test.event");
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_action_started_fields() {
        let event = LifecycleEvent::action_started("Build", "CodeBuild", 1);
        assert_eq!(event.event_type, "action.started");
        assert_eq!(event.data.get("stage"), Some(&serde_json::json!("Build")));
        assert_eq!(event.data.get("attempt"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_for_run_adds_correlation() {
        let run_id = uuid::Uuid::new_v4();
        let event = LifecycleEvent::stage_started("Test").for_run("api", &run_id);
        assert_eq!(event.data.get("pipeline"), Some(&serde_json::json!("api")));
        assert_eq!(
            event.data.get("run_id"),
            Some(&serde_json::json!(run_id.to_string()))
        );
    }

    #[test]
    fn test_emit_to_includes_timestamp() {
        let sink = CollectingEventSink::new();
        LifecycleEvent::stage_failed("Prod", "Approve").emit_to(&sink);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "stage.failed");
        let payload = events[0].1.clone().unwrap();
        assert!(payload.get("timestamp").is_some());
        assert_eq!(payload["failed_action"], serde_json::json!("Approve"));
    }
}
