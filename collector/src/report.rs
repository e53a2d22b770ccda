//! Reporting projection: deterministic roll-up of store rows into
//! per-cluster, per-domain and per-project trees, with the
//! `identity_in_v1_api` renaming applied to resource and rate names.
//! Everything is keyed through BTreeMaps so output order is stable.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use shared::config::ClusterConfig;
use shared::models::{
    ClusterAZResource, ClusterRate, ClusterResource, ClusterService, Project, ProjectAZResource,
    ProjectResource, ProjectService,
};
use shared::types::{AvailabilityZone, RateName, ResourceName, ServiceType};
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize, Default)]
pub struct ClusterReport {
    pub services: BTreeMap<String, ClusterServiceReport>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ClusterServiceReport {
    pub liquid_version: i64,
    pub resources: BTreeMap<String, ClusterResourceReport>,
    pub rates: BTreeMap<String, ClusterRateReport>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ClusterResourceReport {
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub per_az: BTreeMap<String, AZCapacityReport>,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct AZCapacityReport {
    pub capacity: u64,
    pub usage: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ClusterRateReport {
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ProjectReport {
    pub name: String,
    pub domain_name: String,
    pub services: BTreeMap<String, ProjectServiceReport>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ProjectServiceReport {
    pub resources: BTreeMap<String, ProjectResourceReport>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ProjectResourceReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_quota: Option<i64>,
    pub usage: u64,
    pub per_az: BTreeMap<String, AZUsageReport>,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct AZUsageReport {
    pub usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DomainReport {
    pub domain_name: String,
    /// Sums of project quota/usage per `service/resource`.
    pub totals: BTreeMap<String, DomainResourceReport>,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct DomainResourceReport {
    pub quota: i64,
    pub usage: u64,
}

/// The name a resource carries in report output: `identity_in_v1_api` is
/// `service/name`, and the name part replaces the catalog name.
fn render_resource_name(
    config: &ClusterConfig,
    service: &ServiceType,
    resource: &str,
) -> String {
    let behavior = config.behavior_for(service, &ResourceName::from(resource));
    match behavior.identity_in_v1_api {
        Some(identity) => identity
            .rsplit_once('/')
            .map(|(_, name)| name.to_string())
            .unwrap_or(identity),
        None => resource.to_string(),
    }
}

fn render_rate_name(config: &ClusterConfig, service: &ServiceType, rate: &str) -> String {
    let behavior = config.rate_behavior_for(service, &RateName::from(rate));
    match behavior.identity_in_v1_api {
        Some(identity) => identity
            .rsplit_once('/')
            .map(|(_, name)| name.to_string())
            .unwrap_or(identity),
        None => rate.to_string(),
    }
}

/// Roll up the service catalog. The pseudo-AZ `total` is synthesized as the
/// sum over all stored AZ rows (real AZs, `any` and `unknown`).
pub fn build_cluster_report(
    config: &ClusterConfig,
    services: &[ClusterService],
    resources: &[ClusterResource],
    az_resources: &[ClusterAZResource],
    rates: &[ClusterRate],
) -> ClusterReport {
    let mut report = ClusterReport::default();
    for service in services {
        let service_type = ServiceType::from(service.service_type.as_str());
        let mut service_report = ClusterServiceReport {
            liquid_version: service.liquid_version,
            ..ClusterServiceReport::default()
        };

        for resource in resources.iter().filter(|r| r.service_id == service.id) {
            let behavior = config.behavior_for(
                &service_type,
                &ResourceName::from(resource.name.as_str()),
            );
            let mut resource_report = ClusterResourceReport {
                unit: resource.unit.clone(),
                category: behavior.category,
                per_az: BTreeMap::new(),
            };

            let mut total = AZCapacityReport::default();
            for az_row in az_resources.iter().filter(|a| a.resource_id == resource.id) {
                let entry = AZCapacityReport {
                    capacity: az_row.raw_capacity.max(0) as u64,
                    usage: az_row.usage.max(0) as u64,
                };
                total.capacity += entry.capacity;
                total.usage += entry.usage;
                resource_report.per_az.insert(az_row.az.clone(), entry);
            }
            resource_report
                .per_az
                .insert(AvailabilityZone::TOTAL.to_string(), total);

            let rendered = render_resource_name(config, &service_type, &resource.name);
            service_report.resources.insert(rendered, resource_report);
        }

        for rate in rates.iter().filter(|r| r.service_id == service.id) {
            let rendered = render_rate_name(config, &service_type, &rate.name);
            service_report
                .rates
                .insert(rendered, ClusterRateReport { unit: rate.unit.clone() });
        }

        report
            .services
            .insert(service.service_type.clone(), service_report);
    }
    report
}

/// Roll up one project.
pub fn build_project_report(
    config: &ClusterConfig,
    project: &Project,
    project_services: &[ProjectService],
    project_resources: &[ProjectResource],
    project_az_resources: &[ProjectAZResource],
) -> ProjectReport {
    let mut report = ProjectReport {
        name: project.name.clone(),
        domain_name: project.domain_name.clone(),
        services: BTreeMap::new(),
    };

    for service in project_services
        .iter()
        .filter(|s| s.project_id == project.id)
    {
        let service_type = ServiceType::from(service.service_type.as_str());
        let mut service_report = ProjectServiceReport::default();

        for resource in project_resources
            .iter()
            .filter(|r| r.project_service_id == service.id)
        {
            let mut resource_report = ProjectResourceReport {
                quota: resource.quota,
                backend_quota: resource.backend_quota,
                usage: 0,
                per_az: BTreeMap::new(),
            };
            for az_row in project_az_resources
                .iter()
                .filter(|a| a.project_resource_id == resource.id)
            {
                let entry = AZUsageReport {
                    usage: az_row.usage.max(0) as u64,
                    physical_usage: az_row.physical_usage.map(|u| u.max(0) as u64),
                };
                resource_report.usage += entry.usage;
                resource_report.per_az.insert(az_row.az.clone(), entry);
            }

            let rendered = render_resource_name(config, &service_type, &resource.name);
            service_report.resources.insert(rendered, resource_report);
        }

        report
            .services
            .insert(service.service_type.clone(), service_report);
    }
    report
}

/// Aggregate project reports into their domain's totals.
pub fn build_domain_report(domain_name: &str, projects: &[ProjectReport]) -> DomainReport {
    let mut report = DomainReport {
        domain_name: domain_name.to_string(),
        totals: BTreeMap::new(),
    };
    for project in projects {
        for (service_type, service_report) in &project.services {
            for (resource_name, resource_report) in &service_report.resources {
                let key = format!("{service_type}/{resource_name}");
                let entry = report.totals.entry(key).or_default();
                entry.quota += resource_report.quota.unwrap_or(0).max(0);
                entry.usage += resource_report.usage;
            }
        }
    }
    report
}

/// Load everything the cluster report needs and build it.
pub async fn load_cluster_report(
    pool: &PgPool,
    config: &Arc<ClusterConfig>,
) -> anyhow::Result<ClusterReport> {
    let services: Vec<ClusterService> =
        sqlx::query_as("SELECT * FROM cluster_services ORDER BY service_type")
            .fetch_all(pool)
            .await?;
    let resources: Vec<ClusterResource> =
        sqlx::query_as("SELECT * FROM cluster_resources ORDER BY service_id, name")
            .fetch_all(pool)
            .await?;
    let az_resources: Vec<ClusterAZResource> =
        sqlx::query_as("SELECT * FROM cluster_az_resources ORDER BY resource_id, az")
            .fetch_all(pool)
            .await?;
    let rates: Vec<ClusterRate> =
        sqlx::query_as("SELECT * FROM cluster_rates ORDER BY service_id, name")
            .fetch_all(pool)
            .await?;
    Ok(build_cluster_report(
        config,
        &services,
        &resources,
        &az_resources,
        &rates,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config_with_renaming() -> ClusterConfig {
        ClusterConfig::from_yaml(
            r#"
availability_zones: [az-one, az-two]
discovery:
  method: list
liquids:
  compute:
    area: compute
    endpoint: http://liquid-compute:8080
resource_behavior:
  - resource: compute/cores
    identity_in_v1_api: compute/cpu_cores
    category: compute_category
"#,
        )
        .unwrap()
    }

    fn service() -> ClusterService {
        ClusterService {
            id: 1,
            service_type: "compute".to_string(),
            liquid_version: 3,
            next_scrape_at: Utc::now(),
            next_capacity_scrape_at: Utc::now(),
            capacity_scrape_error_count: 0,
            usage_metric_families_json: None,
            capacity_metric_families_json: None,
        }
    }

    fn resource() -> ClusterResource {
        ClusterResource {
            id: 10,
            service_id: 1,
            name: "cores".to_string(),
            liquid_version: 3,
            unit: String::new(),
            topology: shared::models::Topology::AzAware,
            has_capacity: true,
            needs_resource_demand: false,
            has_quota: true,
            attributes_json: None,
        }
    }

    fn az_row(id: i64, az: &str, capacity: i64, usage: i64) -> ClusterAZResource {
        ClusterAZResource {
            id,
            resource_id: 10,
            az: az.to_string(),
            raw_capacity: capacity,
            usage,
            last_nonzero_raw_capacity: None,
        }
    }

    #[test]
    fn test_cluster_report_synthesizes_total() {
        let config = config_with_renaming();
        let report = build_cluster_report(
            &config,
            &[service()],
            &[resource()],
            &[
                az_row(1, "az-one", 100, 30),
                az_row(2, "az-two", 200, 60),
                az_row(3, "unknown", 7, 0),
            ],
            &[],
        );

        let compute = &report.services["compute"];
        assert_eq!(compute.liquid_version, 3);
        // renamed via identity_in_v1_api
        let cores = &compute.resources["cpu_cores"];
        assert_eq!(cores.category.as_deref(), Some("compute_category"));
        assert_eq!(cores.per_az["total"].capacity, 307);
        assert_eq!(cores.per_az["total"].usage, 90);
        assert_eq!(cores.per_az["az-one"].capacity, 100);
    }

    #[test]
    fn test_domain_report_aggregates_projects() {
        let mut p1 = ProjectReport {
            name: "p1".to_string(),
            domain_name: "d".to_string(),
            services: BTreeMap::new(),
        };
        let mut service_report = ProjectServiceReport::default();
        service_report.resources.insert(
            "cores".to_string(),
            ProjectResourceReport {
                quota: Some(10),
                backend_quota: Some(10),
                usage: 4,
                per_az: BTreeMap::new(),
            },
        );
        p1.services.insert("compute".to_string(), service_report);
        let mut p2 = p1.clone();
        p2.name = "p2".to_string();

        let domain = build_domain_report("d", &[p1, p2]);
        let totals = &domain.totals["compute/cores"];
        assert_eq!(totals.quota, 20);
        assert_eq!(totals.usage, 8);
    }

    #[test]
    fn test_report_order_is_deterministic() {
        let config = config_with_renaming();
        let report = build_cluster_report(
            &config,
            &[service()],
            &[resource()],
            &[az_row(1, "az-two", 1, 0), az_row(2, "az-one", 2, 0)],
            &[],
        );
        let keys: Vec<&String> = report.services["compute"].resources["cpu_cores"]
            .per_az
            .keys()
            .collect();
        assert_eq!(keys, ["az-one", "az-two", "total"]);
    }
}
