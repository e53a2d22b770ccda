//! Wire types for the adapter ("liquid") protocol: JSON over HTTP with the
//! four endpoints `/v1/info`, `/v1/report-capacity`,
//! `/v1/projects/{uuid}/report-usage` and `/v1/projects/{uuid}/quota`.
//!
//! Responses are deserialized strictly: unknown fields are a protocol error,
//! and the mandatory `info_version` field drives cache invalidation.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Topology;
use crate::types::{AvailabilityZone, PerAZ, RateName, ResourceName, Unit};

/// Versioned metadata about a backend service, returned by `GET /v1/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceInfo {
    pub version: i64,
    #[serde(default)]
    pub resources: BTreeMap<ResourceName, ResourceInfo>,
    #[serde(default)]
    pub rates: BTreeMap<RateName, RateInfo>,
    #[serde(default)]
    pub usage_metric_families: Option<serde_json::Value>,
    #[serde(default)]
    pub capacity_metric_families: Option<serde_json::Value>,
    #[serde(default)]
    pub flags: ServiceInfoFlags,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceInfoFlags {
    #[serde(default)]
    pub usage_report_needs_project_metadata: bool,
    #[serde(default)]
    pub quota_update_needs_project_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceInfo {
    pub unit: Unit,
    pub topology: Topology,
    pub has_capacity: bool,
    #[serde(default)]
    pub needs_resource_demand: bool,
    pub has_quota: bool,
    #[serde(default)]
    pub attributes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateInfo {
    pub unit: Unit,
    pub has_usage: bool,
}

impl ServiceInfo {
    /// Sanity-check an info document before it is allowed into the catalog.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if self.version <= 0 {
            errors.push(format!("version must be positive, got {}", self.version));
        }
        for name in self.resources.keys() {
            if name.as_str().is_empty() {
                errors.push("resource with empty name".to_string());
            }
        }
        for name in self.rates.keys() {
            if name.as_str().is_empty() {
                errors.push("rate with empty name".to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

/// Aggregated demand for one resource, in raw units, passed to the adapter
/// during capacity scrape for resources that declare `needs_resource_demand`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDemand {
    pub usage: u64,
    pub unused_commitments: u64,
    pub pending_commitments: u64,
}

impl ResourceDemand {
    pub fn add(&mut self, other: ResourceDemand) {
        self.usage += other.usage;
        self.unused_commitments += other.unused_commitments;
        self.pending_commitments += other.pending_commitments;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityRequest {
    pub all_azs: Vec<AvailabilityZone>,
    pub demand_by_resource: BTreeMap<ResourceName, ResourceDemand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapacityReport {
    pub info_version: i64,
    pub resources: BTreeMap<ResourceName, ResourceCapacityReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceCapacityReport {
    pub per_az: PerAZ<AZResourceCapacityReport>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AZResourceCapacityReport {
    pub capacity: u64,
    #[serde(default)]
    pub usage: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRequest {
    pub all_azs: Vec<AvailabilityZone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serialized_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_metadata: Option<ProjectMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageReport {
    pub info_version: i64,
    pub resources: BTreeMap<ResourceName, ResourceUsageReport>,
    #[serde(default)]
    pub rates: BTreeMap<RateName, RateUsageReport>,
    /// Opaque to the core; adapters use it for counter-reset detection.
    #[serde(default)]
    pub serialized_state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceUsageReport {
    /// The backend's own idea of the quota, if it has one.
    #[serde(default)]
    pub quota: Option<i64>,
    pub per_az: PerAZ<AZResourceUsageReport>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AZResourceUsageReport {
    pub usage: u64,
    #[serde(default)]
    pub physical_usage: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateUsageReport {
    /// Monotonically increasing counter; may exceed 2^63.
    pub usage: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaRequest {
    pub resources: BTreeMap<ResourceName, QuotaRequestEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_metadata: Option<ProjectMetadata>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaRequestEntry {
    pub quota: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub uuid: Uuid,
    pub name: String,
    pub domain: DomainMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainMetadata {
    pub uuid: Uuid,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_info_parses() {
        let info: ServiceInfo = serde_json::from_str(
            r#"{
                "version": 5,
                "resources": {
                    "cores": {
                        "unit": "",
                        "topology": "az-aware",
                        "has_capacity": true,
                        "needs_resource_demand": true,
                        "has_quota": true
                    }
                },
                "rates": {
                    "instance-creations": {"unit": "", "has_usage": true}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(info.version, 5);
        let cores = &info.resources[&ResourceName::from("cores")];
        assert_eq!(cores.topology, Topology::AzAware);
        assert!(cores.needs_resource_demand);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = serde_json::from_str::<ServiceInfo>(
            r#"{"version": 1, "surprise": true}"#,
        );
        assert!(result.is_err());

        let result = serde_json::from_str::<CapacityReport>(
            r#"{"info_version": 1, "resources": {}, "extra": 1}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_info_version_is_mandatory() {
        let result = serde_json::from_str::<CapacityReport>(r#"{"resources": {}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_rate_usage_exceeding_i64() {
        // above 2^63, still exact
        let report: RateUsageReport =
            serde_json::from_str(r#"{"usage": 18446744073709551615}"#).unwrap();
        assert_eq!(report.usage.to_string(), "18446744073709551615");
    }

    #[test]
    fn test_service_info_validate_rejects_bad_version() {
        let info: ServiceInfo = serde_json::from_str(r#"{"version": 0}"#).unwrap();
        assert!(info.validate().is_err());
    }
}
