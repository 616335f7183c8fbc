//! Deployment environments.

use crate::errors::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

const STACK_NAME_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9-]{0,127}$";

/// The named deployment targets of the delivered system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EnvironmentKind {
    /// Pre-production environment deployed on every successful build.
    Test,
    /// Production, gated behind manual approval.
    Prod,
}

impl EnvironmentKind {
    /// Suffix appended to stack and template names.
    #[must_use]
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Test => "Test",
            Self::Prod => "Prod",
        }
    }

    /// Returns true for the production environment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Prod)
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// A deployment target with its own, fully independent stack identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    /// Which environment this is.
    pub kind: EnvironmentKind,
    /// The stack holding the environment's live state.
    pub stack_name: String,
    /// The public domain of the environment.
    pub domain: String,
}

impl Environment {
    /// Creates an environment after validating its stack name.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack name does not start with a letter or
    /// contains characters other than letters, digits and hyphens.
    pub fn new(
        kind: EnvironmentKind,
        stack_name: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let stack_name = stack_name.into();
        if !is_valid_stack_name(&stack_name) {
            return Err(ConfigError::InvalidStackName(stack_name));
        }
        Ok(Self {
            kind,
            stack_name,
            domain: domain.into(),
        })
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.stack_name)
    }
}

/// Returns true if `name` is acceptable as a stack name.
#[must_use]
pub fn is_valid_stack_name(name: &str) -> bool {
    Regex::new(STACK_NAME_PATTERN)
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}
