//! Per-environment stack templates.
//!
//! A single build renders one template per environment so the test and
//! production deploys consume the identical build output.

use super::{Environment, EnvironmentKind, Target, TargetGroup, TargetType};
use crate::config::PipelineConfig;
use crate::core::ArtifactPayload;
use crate::errors::ShipflowError;
use crate::utils::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Port the service containers listen on.
const CONTAINER_PORT: u16 = 80;

/// Name of the template file for `prefix` in `kind`, e.g. `TriviaBackendTest.template.json`.
#[must_use]
pub fn template_file_name(prefix: &str, kind: EnvironmentKind) -> String {
    format!("{prefix}{}.template.json", kind.suffix())
}

/// One declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Provider resource type, e.g. `ECS::Service`.
    #[serde(rename = "Type")]
    pub resource_type: String,
    /// Resource properties.
    #[serde(rename = "Properties")]
    pub properties: serde_json::Value,
    /// Logical ids that must exist first.
    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Resource {
    fn new(resource_type: &str, properties: serde_json::Value) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: Vec::new(),
        }
    }

    fn after(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| (*s).to_string()).collect();
        self
    }
}

/// The desired state of one environment's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTemplate {
    /// Stack the template is meant for.
    #[serde(rename = "StackName")]
    pub stack_name: String,
    /// Free-form description.
    #[serde(rename = "Description")]
    pub description: String,
    /// Logical id -> resource.
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Resource>,
}

impl StackTemplate {
    /// Renders the load-balanced backend service for `environment`.
    ///
    /// The service target group is declared and then attached to the service;
    /// the test target group stays declared with empty capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot be attached to its target group.
    pub fn backend_service(
        config: &PipelineConfig,
        environment: &Environment,
    ) -> Result<Self, ShipflowError> {
        let service = &config.service;
        let mut resources = BTreeMap::new();

        resources.insert(
            "VPC".to_string(),
            Resource::new("EC2::VPC", serde_json::json!({ "MaxAZs": 2 })),
        );
        resources.insert(
            "Cluster".to_string(),
            Resource::new("ECS::Cluster", serde_json::json!({ "Vpc": "VPC" })).after(&["VPC"]),
        );
        resources.insert(
            "Certificate".to_string(),
            Resource::new(
                "CertificateManager::Certificate",
                serde_json::json!({ "ArnParameter": format!("CertificateArn-{}", environment.domain) }),
            ),
        );
        resources.insert(
            "LoadBalancer".to_string(),
            Resource::new(
                "ElasticLoadBalancingV2::LoadBalancer",
                serde_json::json!({ "Scheme": "internet-facing", "Vpc": "VPC" }),
            )
            .after(&["VPC"]),
        );
        resources.insert(
            "Service".to_string(),
            Resource::new(
                "ECS::Service",
                serde_json::json!({
                    "LaunchType": "FARGATE",
                    "Cluster": "Cluster",
                    "DesiredCount": service.desired_count,
                    "Image": format!("{}:{}", service.repository_name, service.image_tag),
                    "TargetGroup": "ServiceTargetGroup",
                }),
            )
            .after(&["Cluster", "ServiceTargetGroup"]),
        );
        let mut service_targets = TargetGroup::declare("ECS", CONTAINER_PORT, TargetType::Ip);
        service_targets.attach(vec![Target::service("Service", CONTAINER_PORT)])?;
        resources.insert(
            "ServiceTargetGroup".to_string(),
            target_group_resource(&service_targets),
        );
        resources.insert(
            "Listener".to_string(),
            Resource::new(
                "ElasticLoadBalancingV2::Listener",
                serde_json::json!({
                    "Port": 443,
                    "Protocol": "HTTPS",
                    "Certificate": "Certificate",
                    "DefaultTargetGroup": "ServiceTargetGroup",
                }),
            )
            .after(&["LoadBalancer", "Certificate", "ServiceTargetGroup"]),
        );

        // Second listener for testing; its targets are attached by a later deployment.
        resources.insert(
            "TestTargetGroup".to_string(),
            target_group_resource(&TargetGroup::declare("ECS2", CONTAINER_PORT, TargetType::Ip)),
        );
        resources.insert(
            "TestListener".to_string(),
            Resource::new(
                "ElasticLoadBalancingV2::Listener",
                serde_json::json!({
                    "Port": service.test_listener_port,
                    "Protocol": "HTTPS",
                    "Open": true,
                    "Certificate": "Certificate",
                    "DefaultTargetGroup": "TestTargetGroup",
                }),
            )
            .after(&["LoadBalancer", "Certificate", "TestTargetGroup"]),
        );

        resources.insert(
            "DnsRecord".to_string(),
            Resource::new(
                "Route53::RecordSet",
                serde_json::json!({
                    "Name": environment.domain,
                    "HostedZone": config.domain_zone,
                    "AliasTarget": "LoadBalancer",
                }),
            )
            .after(&["LoadBalancer"]),
        );

        for (group, label) in [("ServiceTargetGroup", "TargetGroup"), ("TestTargetGroup", "TargetGroup2")] {
            resources.insert(
                format!("{label}UnhealthyHosts"),
                alarm_resource(group, "UnHealthyHostCount"),
            );
            resources.insert(
                format!("{label}5xx"),
                alarm_resource(group, "HTTPCode_Target_5XX_Count"),
            );
        }

        Ok(Self {
            stack_name: environment.stack_name.clone(),
            description: format!("Backend service ({})", environment.kind),
            resources,
        })
    }

    /// Renders deterministic JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Returns the SHA-256 of the rendered JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        self.to_json().map(sha256_hex)
    }

    /// Returns a per-resource fingerprint map, the form environments diff against.
    #[must_use]
    pub fn fingerprints(&self) -> BTreeMap<String, String> {
        self.resources
            .iter()
            .map(|(id, resource)| {
                let rendered = serde_json::to_string(resource).unwrap_or_default();
                (id.clone(), sha256_hex(rendered))
            })
            .collect()
    }
}

/// Renders the backend templates for both environments into one build payload.
///
/// # Errors
///
/// Returns an error if an environment's stack name is invalid or a
/// template fails to render.
pub fn render_backend_bundle(
    config: &PipelineConfig,
    stack_prefix: &str,
    location: impl Into<String>,
) -> Result<(ArtifactPayload, BTreeMap<String, StackTemplate>), ShipflowError> {
    let mut payload = ArtifactPayload::new(location);
    let mut templates = BTreeMap::new();
    for kind in [EnvironmentKind::Test, EnvironmentKind::Prod] {
        let environment = config.environment(kind, stack_prefix)?;
        let template = StackTemplate::backend_service(config, &environment)?;
        let path = template_file_name(stack_prefix, kind);
        let digest = template
            .digest()
            .map_err(|e| ShipflowError::Internal(format!("failed to render {path}: {e}")))?;
        payload = payload.with_file(path.clone(), digest);
        templates.insert(path, template);
    }
    Ok((payload, templates))
}

fn target_group_resource(group: &TargetGroup) -> Resource {
    Resource::new(
        "ElasticLoadBalancingV2::TargetGroup",
        serde_json::json!({
            "Name": group.name,
            "Port": group.port,
            "TargetType": group.target_type,
            "State": group.state(),
            "Targets": group.targets(),
        }),
    )
}

fn alarm_resource(target_group: &str, metric: &str) -> Resource {
    Resource::new(
        "CloudWatch::Alarm",
        serde_json::json!({
            "TargetGroup": target_group,
            "Metric": metric,
            "Threshold": 1,
            "EvaluationPeriods": 2,
        }),
    )
    .after(&[target_group])
}
