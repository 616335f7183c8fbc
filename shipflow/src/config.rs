//! Pipeline configuration.
//!
//! Configuration is an explicit value passed into every pipeline blueprint.
//! The library never reads process state; [`PipelineConfig::from_env`] exists
//! for binaries that want the conventional environment variables.

use crate::deploy::{Environment, EnvironmentKind};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Environment variable names understood by [`PipelineConfig::from_env`].
pub mod env_vars {
    /// Repository owner.
    pub const REPO_OWNER: &str = "GIT_REPO_OWNER";
    /// Repository name.
    pub const REPO_NAME: &str = "GIT_REPO_NAME";
    /// Test environment domain.
    pub const DOMAIN_TEST: &str = "DOMAIN_TEST";
    /// Production environment domain.
    pub const DOMAIN_PROD: &str = "DOMAIN_PROD";
    /// Hosted zone containing both domains.
    pub const DOMAIN_ZONE: &str = "DOMAIN_ZONE";
    /// Image repository of the backend service.
    pub const IMAGE_REPO_NAME: &str = "IMAGE_REPO_NAME";
    /// Image tag deployed by the backend service.
    pub const IMAGE_TAG: &str = "IMAGE_TAG";
}

/// Configuration shared by all pipelines of the delivered system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Owner of the source repository. Default: `aws-samples`.
    #[serde(default = "default_repo_owner")]
    pub repo_owner: String,
    /// Name of the source repository. Default: `aws-reinvent-2018-trivia-game`.
    #[serde(default = "default_repo_name")]
    pub repo_name: String,
    /// Domain of the test environment. Default: `api-test.reinvent-trivia.com`.
    #[serde(default = "default_domain_test")]
    pub domain_test: String,
    /// Domain of the production environment. Default: `api.reinvent-trivia.com`.
    #[serde(default = "default_domain_prod")]
    pub domain_prod: String,
    /// Hosted zone both domains live in. Default: `reinvent-trivia.com`.
    #[serde(default = "default_domain_zone")]
    pub domain_zone: String,
    /// Settings of the deployed backend service.
    #[serde(default)]
    pub service: ServiceConfig,
}

fn default_repo_owner() -> String {
    "aws-samples".to_string()
}

fn default_repo_name() -> String {
    "aws-reinvent-2018-trivia-game".to_string()
}

fn default_domain_test() -> String {
    "api-test.reinvent-trivia.com".to_string()
}

fn default_domain_prod() -> String {
    "api.reinvent-trivia.com".to_string()
}

fn default_domain_zone() -> String {
    "reinvent-trivia.com".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            repo_owner: default_repo_owner(),
            repo_name: default_repo_name(),
            domain_test: default_domain_test(),
            domain_prod: default_domain_prod(),
            domain_zone: default_domain_zone(),
            service: ServiceConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source repository.
    #[must_use]
    pub fn with_repo(mut self, owner: impl Into<String>, name: impl Into<String>) -> Self {
        self.repo_owner = owner.into();
        self.repo_name = name.into();
        self
    }

    /// Sets the domains.
    #[must_use]
    pub fn with_domains(
        mut self,
        test: impl Into<String>,
        prod: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        self.domain_test = test.into();
        self.domain_prod = prod.into();
        self.domain_zone = zone.into();
        self
    }

    /// Loads the configuration from the process environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Loads the configuration from a map of environment variables.
    ///
    /// Unset and empty variables keep their defaults.
    #[must_use]
    pub fn from_env_map(vars: &HashMap<String, String>) -> Self {
        let pick = |key: &str, default: String| {
            vars.get(key)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .unwrap_or(default)
        };
        let service_defaults = ServiceConfig::default();

        Self {
            repo_owner: pick(env_vars::REPO_OWNER, default_repo_owner()),
            repo_name: pick(env_vars::REPO_NAME, default_repo_name()),
            domain_test: pick(env_vars::DOMAIN_TEST, default_domain_test()),
            domain_prod: pick(env_vars::DOMAIN_PROD, default_domain_prod()),
            domain_zone: pick(env_vars::DOMAIN_ZONE, default_domain_zone()),
            service: ServiceConfig {
                repository_name: pick(env_vars::IMAGE_REPO_NAME, service_defaults.repository_name.clone()),
                image_tag: pick(env_vars::IMAGE_TAG, service_defaults.image_tag.clone()),
                ..service_defaults
            },
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is empty, a domain is outside the zone,
    /// or test and prod share a domain.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("repo_owner", &self.repo_owner),
            ("repo_name", &self.repo_name),
            ("domain_test", &self.domain_test),
            ("domain_prod", &self.domain_prod),
            ("domain_zone", &self.domain_zone),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty {
                    field: field.to_string(),
                });
            }
        }

        for domain in [&self.domain_test, &self.domain_prod] {
            if !domain_in_zone(domain, &self.domain_zone) {
                return Err(ConfigError::DomainOutsideZone {
                    domain: domain.clone(),
                    zone: self.domain_zone.clone(),
                });
            }
        }

        if self.domain_test.eq_ignore_ascii_case(&self.domain_prod) {
            return Err(ConfigError::SharedDomain(self.domain_test.clone()));
        }

        self.service.validate()
    }

    /// Returns the domain serving the given environment.
    #[must_use]
    pub fn domain_for(&self, kind: EnvironmentKind) -> &str {
        match kind {
            EnvironmentKind::Test => &self.domain_test,
            EnvironmentKind::Prod => &self.domain_prod,
        }
    }

    /// Derives the environment for `kind` with stack name `{stack_prefix}{Test|Prod}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the derived stack name is invalid.
    pub fn environment(
        &self,
        kind: EnvironmentKind,
        stack_prefix: &str,
    ) -> Result<Environment, ConfigError> {
        Environment::new(
            kind,
            format!("{stack_prefix}{}", kind.suffix()),
            self.domain_for(kind),
        )
    }
}

fn domain_in_zone(domain: &str, zone: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let zone = zone.trim_end_matches('.').to_ascii_lowercase();
    domain == zone || domain.ends_with(&format!(".{zone}"))
}

/// Settings of the load-balanced backend service rendered into stack templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image repository of the service. Default: `reinvent-trivia-backend`.
    #[serde(default = "default_repository_name")]
    pub repository_name: String,
    /// Image tag to deploy. Default: `latest`.
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    /// Repository of the pre-built base image. Default: `reinvent-trivia-backend-base`.
    #[serde(default = "default_base_image_repository")]
    pub base_image_repository: String,
    /// Tag of the base image consumed by builds. Default: `release`.
    #[serde(default = "default_base_image_tag")]
    pub base_image_tag: String,
    /// Number of running tasks. Default: 3.
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    /// Port of the second listener used for testing. Default: 9002.
    #[serde(default = "default_test_listener_port")]
    pub test_listener_port: u16,
}

fn default_repository_name() -> String {
    "reinvent-trivia-backend".to_string()
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_base_image_repository() -> String {
    "reinvent-trivia-backend-base".to_string()
}

fn default_base_image_tag() -> String {
    "release".to_string()
}

fn default_desired_count() -> u32 {
    3
}

fn default_test_listener_port() -> u16 {
    9002
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            repository_name: default_repository_name(),
            image_tag: default_image_tag(),
            base_image_repository: default_base_image_repository(),
            base_image_tag: default_base_image_tag(),
            desired_count: default_desired_count(),
            test_listener_port: default_test_listener_port(),
        }
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("service.repository_name", &self.repository_name),
            ("service.image_tag", &self.image_tag),
            ("service.base_image_repository", &self.base_image_repository),
            ("service.base_image_tag", &self.base_image_tag),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty {
                    field: field.to_string(),
                });
            }
        }
        if self.desired_count == 0 {
            return Err(ConfigError::OutOfRange {
                field: "service.desired_count".to_string(),
                value: self.desired_count.to_string(),
            });
        }
        if matches!(self.test_listener_port, 0 | 443) {
            return Err(ConfigError::OutOfRange {
                field: "service.test_listener_port".to_string(),
                value: self.test_listener_port.to_string(),
            });
        }
        Ok(())
    }
}
