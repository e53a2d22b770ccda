//! Declarative cluster configuration.
//!
//! One YAML document describes the whole cluster: the real availability
//! zones, the adapter ("liquid") bindings per service, resource and rate
//! behavior rules, quota distribution rules and the mail templates.
//! Validation runs once at startup and aggregates every problem it finds,
//! so operators fix a broken file in one round trip.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    AvailabilityZone, OvercommitFactor, PerAZ, RateName, ResourceName, ServiceType, TimeSpan,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Read(String),
    #[error("cannot parse configuration file: {0}")]
    Parse(String),
    #[error("configuration is invalid:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Process-wide cluster description. Immutable after startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub availability_zones: Vec<AvailabilityZone>,
    pub discovery: DiscoveryConfig,
    pub liquids: BTreeMap<ServiceType, LiquidConfig>,
    #[serde(default)]
    pub resource_behavior: Vec<ResourceBehaviorRule>,
    #[serde(default)]
    pub rate_behavior: Vec<RateBehaviorRule>,
    #[serde(default)]
    pub quota_distribution_configs: Vec<QuotaDistributionRule>,
    #[serde(default)]
    pub mail_notifications: Option<MailConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub method: DiscoveryMethod,
    #[serde(default)]
    pub static_projects: Vec<StaticProject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    List,
    Static,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticProject {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
    pub domain_uuid: Uuid,
    pub domain_name: String,
}

/// Binding of one service type to its backend adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LiquidConfig {
    pub area: String,
    pub endpoint: String,
    #[serde(default)]
    pub liquid_service_type: Option<String>,
    #[serde(default)]
    pub fixed_capacity_values: Option<BTreeMap<ResourceName, PerAZ<u64>>>,
    #[serde(default)]
    pub capacity_values_from_prometheus: Option<PrometheusCapacityConfig>,
    #[serde(default)]
    pub rate_limits: Option<RateLimitConfig>,
    #[serde(default)]
    pub commitment_behavior_per_resource: Vec<CommitmentBehaviorRule>,
}

impl LiquidConfig {
    /// The adapter's own service type on the wire, `liquid-<service>` unless
    /// overridden.
    pub fn liquid_service_type(&self, service_type: &ServiceType) -> String {
        match &self.liquid_service_type {
            Some(t) => t.clone(),
            None => format!("liquid-{service_type}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusCapacityConfig {
    pub api_url: String,
    /// One query per resource; result samples must carry an `az` label.
    pub queries: BTreeMap<ResourceName, String>,
    #[serde(default)]
    pub allow_zero_capacity: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub global: Vec<RateLimitEntry>,
    #[serde(default)]
    pub project_default: Vec<RateLimitEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitEntry {
    pub name: RateName,
    pub limit: u64,
    pub window: TimeSpan,
}

/// One behavior rule; `resource` is a regex matched in full against
/// `service/resource`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceBehaviorRule {
    pub resource: String,
    #[serde(default)]
    pub overcommit_factor: Option<OvercommitFactor>,
    #[serde(default)]
    pub identity_in_v1_api: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(skip)]
    matcher: Option<Regex>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateBehaviorRule {
    pub rate: String,
    #[serde(default)]
    pub identity_in_v1_api: Option<String>,
    #[serde(skip)]
    matcher: Option<Regex>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaDistributionRule {
    pub resource: String,
    pub autogrow: AutogrowConfig,
    #[serde(skip)]
    matcher: Option<Regex>,
}

/// Parameters of the `autogrow` quota distribution model.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutogrowConfig {
    #[serde(default)]
    pub project_base_quota: u64,
    pub growth_multiplier: f64,
    #[serde(default)]
    pub growth_minimum: u64,
    #[serde(default)]
    pub allow_quota_overcommit_until_allocated_percent: f64,
    pub usage_data_retention_period: TimeSpan,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitmentBehaviorRule {
    /// Regex matched in full against the bare resource name within this
    /// service.
    pub resource: String,
    #[serde(default)]
    pub durations: Vec<TimeSpan>,
    #[serde(default)]
    pub min_confirm_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversion_rule: Option<ConversionRule>,
    #[serde(skip)]
    matcher: Option<Regex>,
}

/// Commitments on two resources are convertible iff their conversion rules
/// share the same identifier; weights set the integer exchange ratio.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversionRule {
    pub identifier: String,
    pub weight: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailConfig {
    pub templates: MailTemplates,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailTemplates {
    pub confirmed_commitments: MailTemplate,
    pub expired_commitments: MailTemplate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailTemplate {
    pub subject: String,
    pub body: String,
}

/// Merged view of all resource-behavior rules matching one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceBehavior {
    pub overcommit_factor: OvercommitFactor,
    pub identity_in_v1_api: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateBehavior {
    pub identity_in_v1_api: Option<String>,
}

fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

fn matches(matcher: &Option<Regex>, candidate: &str) -> bool {
    matcher.as_ref().is_some_and(|m| m.is_match(candidate))
}

impl ClusterConfig {
    /// Load and validate the cluster configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let buf = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_yaml(&buf)
    }

    pub fn from_yaml(buf: &str) -> Result<Self, ConfigError> {
        let mut config: ClusterConfig =
            serde_yaml::from_str(buf).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole document, collecting every error before failing, and
    /// compile the behavior-rule matchers.
    fn validate(&mut self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.availability_zones.is_empty() {
            errors.push("availability_zones must list at least one AZ".to_string());
        }
        let mut seen_azs = BTreeSet::new();
        for az in &self.availability_zones {
            if !az.is_real() {
                errors.push(format!(
                    "availability zone name {:?} is reserved or empty",
                    az.as_str()
                ));
            }
            if !seen_azs.insert(az.clone()) {
                errors.push(format!("duplicate availability zone {:?}", az.as_str()));
            }
        }

        match self.discovery.method {
            DiscoveryMethod::Static => {
                if self.discovery.static_projects.is_empty() {
                    errors.push(
                        "discovery.method = static requires discovery.static_projects".to_string(),
                    );
                }
            }
            DiscoveryMethod::List => {
                if !self.discovery.static_projects.is_empty() {
                    errors.push(
                        "discovery.static_projects is only allowed with discovery.method = static"
                            .to_string(),
                    );
                }
            }
        }

        if self.liquids.is_empty() {
            errors.push("at least one liquid must be configured".to_string());
        }
        for (service_type, liquid) in &mut self.liquids {
            if liquid.endpoint.is_empty() {
                errors.push(format!("liquids.{service_type}.endpoint is missing"));
            }
            if liquid.area.is_empty() {
                errors.push(format!("liquids.{service_type}.area is missing"));
            }
            for rule in &mut liquid.commitment_behavior_per_resource {
                match compile_anchored(&rule.resource) {
                    Ok(m) => rule.matcher = Some(m),
                    Err(e) => errors.push(format!(
                        "liquids.{service_type}: invalid resource pattern {:?}: {e}",
                        rule.resource
                    )),
                }
                if rule.durations.is_empty() && rule.conversion_rule.is_none() {
                    errors.push(format!(
                        "liquids.{service_type}: commitment behavior for {:?} needs durations or a conversion rule",
                        rule.resource
                    ));
                }
                if let Some(conversion) = &rule.conversion_rule {
                    if conversion.weight == 0 {
                        errors.push(format!(
                            "liquids.{service_type}: conversion weight for {:?} must be positive",
                            rule.resource
                        ));
                    }
                    if conversion.identifier.is_empty() {
                        errors.push(format!(
                            "liquids.{service_type}: conversion identifier for {:?} is empty",
                            rule.resource
                        ));
                    }
                }
            }
        }

        for rule in &mut self.resource_behavior {
            match compile_anchored(&rule.resource) {
                Ok(m) => rule.matcher = Some(m),
                Err(e) => errors.push(format!(
                    "resource_behavior: invalid pattern {:?}: {e}",
                    rule.resource
                )),
            }
            if let Some(factor) = rule.overcommit_factor {
                if !(factor.0.is_finite() && factor.0 >= 0.0) {
                    errors.push(format!(
                        "resource_behavior {:?}: overcommit_factor must be a finite non-negative number",
                        rule.resource
                    ));
                }
            }
        }

        for rule in &mut self.rate_behavior {
            match compile_anchored(&rule.rate) {
                Ok(m) => rule.matcher = Some(m),
                Err(e) => {
                    errors.push(format!("rate_behavior: invalid pattern {:?}: {e}", rule.rate))
                }
            }
        }

        for rule in &mut self.quota_distribution_configs {
            match compile_anchored(&rule.resource) {
                Ok(m) => rule.matcher = Some(m),
                Err(e) => errors.push(format!(
                    "quota_distribution_configs: invalid pattern {:?}: {e}",
                    rule.resource
                )),
            }
            let autogrow = &rule.autogrow;
            if !(autogrow.growth_multiplier.is_finite() && autogrow.growth_multiplier >= 0.0) {
                errors.push(format!(
                    "quota_distribution_configs {:?}: growth_multiplier must be a finite non-negative number",
                    rule.resource
                ));
            }
            let pct = autogrow.allow_quota_overcommit_until_allocated_percent;
            if !(pct.is_finite() && (0.0..=100.0).contains(&pct)) {
                errors.push(format!(
                    "quota_distribution_configs {:?}: allow_quota_overcommit_until_allocated_percent must be between 0 and 100",
                    rule.resource
                ));
            }
            if autogrow.usage_data_retention_period.is_zero() {
                errors.push(format!(
                    "quota_distribution_configs {:?}: usage_data_retention_period must be positive",
                    rule.resource
                ));
            }
        }

        if let Some(mail) = &self.mail_notifications {
            for (name, template) in [
                ("confirmed_commitments", &mail.templates.confirmed_commitments),
                ("expired_commitments", &mail.templates.expired_commitments),
            ] {
                if template.subject.is_empty() {
                    errors.push(format!("mail_notifications.templates.{name}.subject is empty"));
                }
                if template.body.is_empty() {
                    errors.push(format!("mail_notifications.templates.{name}.body is empty"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Merged resource behavior; rules are considered in order and the first
    /// one providing a field wins for that field.
    pub fn behavior_for(&self, service: &ServiceType, resource: &ResourceName) -> ResourceBehavior {
        let full_name = format!("{service}/{resource}");
        let mut behavior = ResourceBehavior::default();
        let mut factor_set = false;
        for rule in &self.resource_behavior {
            if !matches(&rule.matcher, &full_name) {
                continue;
            }
            if let Some(factor) = rule.overcommit_factor {
                if !factor_set {
                    behavior.overcommit_factor = factor;
                    factor_set = true;
                }
            }
            if behavior.identity_in_v1_api.is_none() {
                behavior.identity_in_v1_api = rule.identity_in_v1_api.clone();
            }
            if behavior.category.is_none() {
                behavior.category = rule.category.clone();
            }
        }
        behavior
    }

    pub fn rate_behavior_for(&self, service: &ServiceType, rate: &RateName) -> RateBehavior {
        let full_name = format!("{service}/{rate}");
        let mut behavior = RateBehavior::default();
        for rule in &self.rate_behavior {
            if !matches(&rule.matcher, &full_name) {
                continue;
            }
            if behavior.identity_in_v1_api.is_none() {
                behavior.identity_in_v1_api = rule.identity_in_v1_api.clone();
            }
        }
        behavior
    }

    /// First matching autogrow configuration, if any. Resources without one
    /// do not take part in quota distribution.
    pub fn autogrow_for(
        &self,
        service: &ServiceType,
        resource: &ResourceName,
    ) -> Option<&AutogrowConfig> {
        let full_name = format!("{service}/{resource}");
        self.quota_distribution_configs
            .iter()
            .find(|rule| matches(&rule.matcher, &full_name))
            .map(|rule| &rule.autogrow)
    }

    pub fn commitment_behavior_for(
        &self,
        service: &ServiceType,
        resource: &ResourceName,
    ) -> Option<&CommitmentBehaviorRule> {
        let liquid = self.liquids.get(service)?;
        liquid
            .commitment_behavior_per_resource
            .iter()
            .find(|rule| matches(&rule.matcher, resource.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
availability_zones: [az-one, az-two]
discovery:
  method: list
liquids:
  compute:
    area: compute
    endpoint: http://liquid-compute:8080
"#;

    #[test]
    fn test_minimal_config_is_valid() {
        let config = ClusterConfig::from_yaml(MINIMAL).expect("minimal config should load");
        assert_eq!(config.availability_zones.len(), 2);
        let compute = ServiceType::from("compute");
        assert_eq!(
            config.liquids[&compute].liquid_service_type(&compute),
            "liquid-compute"
        );
    }

    #[test]
    fn test_errors_are_aggregated() {
        let err = ClusterConfig::from_yaml(
            r#"
availability_zones: [any, az-one, az-one]
discovery:
  method: static
liquids: {}
"#,
        )
        .unwrap_err();
        match err {
            ConfigError::Invalid(errors) => {
                assert!(errors.len() >= 3, "expected several errors, got {errors:?}");
                assert!(errors.iter().any(|e| e.contains("reserved")));
                assert!(errors.iter().any(|e| e.contains("duplicate")));
                assert!(errors.iter().any(|e| e.contains("static_projects")));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = ClusterConfig::from_yaml(
            r#"
availability_zones: [az-one]
discovery:
  method: list
liquids:
  compute:
    area: compute
    endpoint: http://liquid-compute:8080
    no_such_option: true
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_behavior_merging_first_match_wins_per_field() {
        let config = ClusterConfig::from_yaml(
            r#"
availability_zones: [az-one]
discovery:
  method: list
liquids:
  compute:
    area: compute
    endpoint: http://liquid-compute:8080
resource_behavior:
  - resource: compute/cores
    overcommit_factor: 4.0
  - resource: compute/.*
    overcommit_factor: 1.5
    category: compute_category
"#,
        )
        .unwrap();

        let service = ServiceType::from("compute");
        let behavior = config.behavior_for(&service, &ResourceName::from("cores"));
        assert_eq!(behavior.overcommit_factor, OvercommitFactor(4.0));
        assert_eq!(behavior.category.as_deref(), Some("compute_category"));

        let behavior = config.behavior_for(&service, &ResourceName::from("ram"));
        assert_eq!(behavior.overcommit_factor, OvercommitFactor(1.5));

        // patterns are anchored: "compute/cores" must not match "compute/cores2"
        let behavior = config.behavior_for(&service, &ResourceName::from("cores2"));
        assert_eq!(behavior.overcommit_factor, OvercommitFactor(1.5));
    }

    #[test]
    fn test_autogrow_lookup() {
        let config = ClusterConfig::from_yaml(
            r#"
availability_zones: [az-one]
discovery:
  method: list
liquids:
  compute:
    area: compute
    endpoint: http://liquid-compute:8080
quota_distribution_configs:
  - resource: compute/cores
    autogrow:
      project_base_quota: 10
      growth_multiplier: 1.2
      usage_data_retention_period: 30 days
"#,
        )
        .unwrap();

        let service = ServiceType::from("compute");
        let autogrow = config
            .autogrow_for(&service, &ResourceName::from("cores"))
            .expect("autogrow config should match");
        assert_eq!(autogrow.project_base_quota, 10);
        assert!(config
            .autogrow_for(&service, &ResourceName::from("ram"))
            .is_none());
    }

    #[test]
    fn test_commitment_behavior_validation() {
        let err = ClusterConfig::from_yaml(
            r#"
availability_zones: [az-one]
discovery:
  method: list
liquids:
  compute:
    area: compute
    endpoint: http://liquid-compute:8080
    commitment_behavior_per_resource:
      - resource: cores
        durations: ["1 year"]
        conversion_rule:
          identifier: ""
          weight: 0
"#,
        )
        .unwrap_err();
        match err {
            ConfigError::Invalid(errors) => {
                assert!(errors.iter().any(|e| e.contains("weight")));
                assert!(errors.iter().any(|e| e.contains("identifier")));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_commitment_behavior_lookup() {
        let config = ClusterConfig::from_yaml(
            r#"
availability_zones: [az-one]
discovery:
  method: list
liquids:
  compute:
    area: compute
    endpoint: http://liquid-compute:8080
    commitment_behavior_per_resource:
      - resource: cores|ram
        durations: ["1 year", "2 years"]
"#,
        )
        .unwrap();
        let service = ServiceType::from("compute");
        assert!(config
            .commitment_behavior_for(&service, &ResourceName::from("cores"))
            .is_some());
        assert!(config
            .commitment_behavior_for(&service, &ResourceName::from("disk"))
            .is_none());
    }
}
