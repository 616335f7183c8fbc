//! Load-balancer target groups with an explicit declare-then-attach lifecycle.
//!
//! A listener may need a target group before any workload exists to serve it
//! (e.g. the test listener used for blue/green checks). The group is declared
//! with empty capacity and populated later by `attach`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How targets are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// Targets are IP addresses (awsvpc tasks).
    Ip,
    /// Targets are instance ids.
    Instance,
}

/// A single registered target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// IP address or instance id.
    pub id: String,
    /// Port traffic is forwarded to.
    pub port: u16,
    /// Addressing mode; must match the group.
    pub target_type: TargetType,
}

impl Target {
    /// Creates an IP target.
    #[must_use]
    pub fn ip(address: impl Into<String>, port: u16) -> Self {
        Self {
            id: address.into(),
            port,
            target_type: TargetType::Ip,
        }
    }

    /// Targets a container service by its logical id; its tasks register by IP.
    #[must_use]
    pub fn service(logical_id: impl Into<String>, port: u16) -> Self {
        Self::ip(logical_id, port)
    }
}

/// Where a target group is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetGroupState {
    /// Exists with no registered targets.
    Declared,
    /// Has at least one registered target.
    Attached,
}

/// Errors raised by the target-group lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetGroupError {
    /// `attach` was called with no targets.
    #[error("Target group '{0}': attach requires at least one target")]
    NoTargets(String),

    /// A target's addressing mode differs from the group's.
    #[error("Target group '{group}': target '{target}' has the wrong target type")]
    TargetTypeMismatch {
        /// The group.
        group: String,
        /// The rejected target.
        target: String,
    },

    /// A target is already registered.
    #[error("Target group '{group}': target '{target}' is already registered")]
    DuplicateTarget {
        /// The group.
        group: String,
        /// The rejected target.
        target: String,
    },
}

/// A target group of a load-balancer listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    /// Logical name.
    pub name: String,
    /// Port the group forwards to.
    pub port: u16,
    /// Addressing mode of all targets.
    pub target_type: TargetType,
    targets: Vec<Target>,
}

impl TargetGroup {
    /// Declares a group with empty capacity.
    #[must_use]
    pub fn declare(name: impl Into<String>, port: u16, target_type: TargetType) -> Self {
        Self {
            name: name.into(),
            port,
            target_type,
            targets: Vec::new(),
        }
    }

    /// Registers real targets.
    ///
    /// All-or-nothing: on error the group is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if `targets` is empty, contains a target of the wrong
    /// type, or repeats an already registered target.
    pub fn attach(&mut self, targets: Vec<Target>) -> Result<(), TargetGroupError> {
        if targets.is_empty() {
            return Err(TargetGroupError::NoTargets(self.name.clone()));
        }
        let mut seen: Vec<&Target> = self.targets.iter().collect();
        for target in &targets {
            if target.target_type != self.target_type {
                return Err(TargetGroupError::TargetTypeMismatch {
                    group: self.name.clone(),
                    target: target.id.clone(),
                });
            }
            if seen.iter().any(|t| t.id == target.id && t.port == target.port) {
                return Err(TargetGroupError::DuplicateTarget {
                    group: self.name.clone(),
                    target: target.id.clone(),
                });
            }
            seen.push(target);
        }
        self.targets.extend(targets);
        Ok(())
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> TargetGroupState {
        if self.targets.is_empty() {
            TargetGroupState::Declared
        } else {
            TargetGroupState::Attached
        }
    }

    /// Returns the registered targets.
    #[must_use]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
}
