//! Adapter connection: wraps the raw `LiquidClient` with the last-known
//! `ServiceInfo`, the capacity overlays (fixed values, metric-derived
//! values) and the catalog reconcile that runs whenever the adapter's
//! `info_version` changes.

use std::collections::BTreeMap;

use shared::config::{LiquidConfig, PrometheusCapacityConfig};
use shared::liquid::{
    AZResourceCapacityReport, CapacityRequest, ProjectMetadata, QuotaRequest, QuotaRequestEntry,
    ResourceDemand, ServiceInfo, UsageReport, UsageRequest,
};
use shared::types::{AvailabilityZone, PerAZ, ResourceName, ServiceType};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::client::{LiquidClient, LiquidError};
use crate::demand::{DemandError, DemandSource};
use crate::promquery::{AZSample, PromQueryError, PrometheusClient};
use crate::reconcile::{self, PgTransaction};

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error(transparent)]
    Liquid(#[from] LiquidError),
    /// The adapter's info version changed while a scrape was in flight; the
    /// caller discards the result and retries after the reconcile.
    #[error("info version changed during scrape (cached {cached}, reported {reported})")]
    VersionChurn { cached: i64, reported: i64 },
    #[error("report is missing {kind} {name:?}")]
    MissingReportEntry { kind: &'static str, name: String },
    #[error("resource {resource:?}: duplicate metric sample for AZ {az:?}")]
    DuplicateMetricSample { resource: String, az: String },
    #[error("resource {resource:?} has zero total capacity, which is forbidden")]
    ZeroCapacityForbidden { resource: String },
    #[error("metric backend error: {0}")]
    Metrics(#[from] PromQueryError),
    #[error("demand aggregation failed: {0}")]
    Demand(#[from] DemandError),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl ScrapeError {
    /// Failure class for metric labels; separates transient from permanent.
    pub fn class(&self) -> &'static str {
        match self {
            ScrapeError::Liquid(LiquidError::Unavailable(_)) => "unavailable",
            ScrapeError::Liquid(LiquidError::Timeout) => "timeout",
            ScrapeError::Liquid(LiquidError::Protocol(_)) => "protocol",
            ScrapeError::Liquid(LiquidError::QuotaRejected(_)) => "quota_rejected",
            ScrapeError::VersionChurn { .. } => "version_churn",
            ScrapeError::MissingReportEntry { .. } => "protocol",
            ScrapeError::DuplicateMetricSample { .. } => "protocol",
            ScrapeError::ZeroCapacityForbidden { .. } => "zero_capacity",
            ScrapeError::Metrics(_) => "metrics",
            ScrapeError::Demand(_) => "demand",
            ScrapeError::Store(_) => "store",
        }
    }

    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            ScrapeError::Liquid(LiquidError::Protocol(_))
                | ScrapeError::VersionChurn { .. }
                | ScrapeError::MissingReportEntry { .. }
        )
    }
}

/// One configured adapter, shared by all jobs touching its service.
pub struct LiquidConnection {
    service_type: ServiceType,
    liquid_service_type: String,
    client: LiquidClient,
    real_azs: Vec<AvailabilityZone>,
    info_cache: RwLock<Option<ServiceInfo>>,
    fixed_capacity_values: Option<BTreeMap<ResourceName, PerAZ<u64>>>,
    prometheus: Option<(PrometheusClient, PrometheusCapacityConfig)>,
}

impl LiquidConnection {
    pub fn new(
        service_type: ServiceType,
        liquid_config: &LiquidConfig,
        real_azs: Vec<AvailabilityZone>,
    ) -> Self {
        let prometheus = liquid_config
            .capacity_values_from_prometheus
            .as_ref()
            .map(|cfg| (PrometheusClient::new(cfg.api_url.clone()), cfg.clone()));

        LiquidConnection {
            liquid_service_type: liquid_config.liquid_service_type(&service_type),
            client: LiquidClient::new(liquid_config.endpoint.clone()),
            real_azs,
            info_cache: RwLock::new(None),
            fixed_capacity_values: liquid_config.fixed_capacity_values.clone(),
            prometheus,
            service_type,
        }
    }

    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    pub fn liquid_service_type(&self) -> &str {
        &self.liquid_service_type
    }

    pub async fn cached_info(&self) -> Option<ServiceInfo> {
        self.info_cache.read().await.clone()
    }

    /// Fetch `/v1/info`, validate it, reconcile the catalog when the version
    /// changed, and update the cache.
    pub async fn refresh(&self, tx: &mut PgTransaction<'_>) -> Result<ServiceInfo, ScrapeError> {
        let service_info = self.client.get_info().await?;
        service_info
            .validate()
            .map_err(|e| ScrapeError::Liquid(LiquidError::Protocol(e)))?;

        let cached_version = self.cached_info().await.map(|i| i.version);
        if cached_version != Some(service_info.version) {
            info!(
                service = %self.service_type,
                old_version = cached_version,
                new_version = service_info.version,
                "service info changed, reconciling catalog"
            );
            reconcile::reconcile_service(
                tx,
                self.service_type.as_str(),
                &self.real_azs,
                &service_info,
            )
            .await?;
        }

        *self.info_cache.write().await = Some(service_info.clone());
        Ok(service_info)
    }

    async fn ensure_info(&self, tx: &mut PgTransaction<'_>) -> Result<ServiceInfo, ScrapeError> {
        match self.cached_info().await {
            Some(service_info) => Ok(service_info),
            None => self.refresh(tx).await,
        }
    }

    /// Usage scrape for one project. On `info_version` churn the scrape is
    /// aborted, the catalog reconciled, and the caller retries.
    pub async fn scrape_usage(
        &self,
        tx: &mut PgTransaction<'_>,
        project: &ProjectMetadata,
        prev_state: Option<String>,
    ) -> Result<UsageReport, ScrapeError> {
        let service_info = self.ensure_info(tx).await?;

        let request = UsageRequest {
            all_azs: self.real_azs.clone(),
            serialized_state: prev_state,
            project_metadata: service_info
                .flags
                .usage_report_needs_project_metadata
                .then(|| project.clone()),
        };
        let report = self.client.report_usage(project.uuid, &request).await?;

        if report.info_version != service_info.version {
            warn!(
                service = %self.service_type,
                cached = service_info.version,
                reported = report.info_version,
                "info version churn during usage scrape"
            );
            self.refresh(tx).await?;
            return Err(ScrapeError::VersionChurn {
                cached: service_info.version,
                reported: report.info_version,
            });
        }

        // every advertised resource and usage-bearing rate must be reported
        for name in service_info.resources.keys() {
            if !report.resources.contains_key(name) {
                return Err(ScrapeError::MissingReportEntry {
                    kind: "resource",
                    name: name.to_string(),
                });
            }
        }
        for (name, rate_info) in &service_info.rates {
            if rate_info.has_usage && !report.rates.contains_key(name) {
                return Err(ScrapeError::MissingReportEntry {
                    kind: "rate",
                    name: name.to_string(),
                });
            }
        }
        Ok(report)
    }

    /// Capacity scrape for the whole service, with demand backchannel and
    /// the two overlays applied in fixed order (fixed values first, then
    /// metric-derived values).
    pub async fn scrape_capacity(
        &self,
        tx: &mut PgTransaction<'_>,
        demand_source: &dyn DemandSource,
    ) -> Result<BTreeMap<ResourceName, PerAZ<AZResourceCapacityReport>>, ScrapeError> {
        let service_info = self.ensure_info(tx).await?;

        let mut demand_by_resource = BTreeMap::new();
        for (name, resource_info) in &service_info.resources {
            if !resource_info.needs_resource_demand {
                continue;
            }
            let per_az = demand_source.demand_for(&self.service_type, name).await?;
            let mut total = ResourceDemand::default();
            for (_, demand) in per_az {
                total.add(demand);
            }
            demand_by_resource.insert(name.clone(), total);
        }

        let request = CapacityRequest {
            all_azs: self.real_azs.clone(),
            demand_by_resource,
        };
        let report = self.client.report_capacity(&request).await?;

        if report.info_version != service_info.version {
            warn!(
                service = %self.service_type,
                cached = service_info.version,
                reported = report.info_version,
                "info version churn during capacity scrape"
            );
            self.refresh(tx).await?;
            return Err(ScrapeError::VersionChurn {
                cached: service_info.version,
                reported: report.info_version,
            });
        }

        for (name, resource_info) in &service_info.resources {
            if resource_info.has_capacity && !report.resources.contains_key(name) {
                return Err(ScrapeError::MissingReportEntry {
                    kind: "resource",
                    name: name.to_string(),
                });
            }
        }

        let mut result: BTreeMap<ResourceName, PerAZ<AZResourceCapacityReport>> = report
            .resources
            .into_iter()
            .map(|(name, resource_report)| {
                (name, fold_capacity(resource_report.per_az, &self.real_azs))
            })
            .collect();

        // overlay 1: fixed capacity values from configuration
        if let Some(fixed) = &self.fixed_capacity_values {
            for (name, per_az) in fixed {
                let folded: PerAZ<AZResourceCapacityReport> = per_az
                    .clone()
                    .normalize(&self.real_azs)
                    .into_iter()
                    .map(|(az, capacity)| {
                        (az, AZResourceCapacityReport { capacity, usage: None })
                    })
                    .collect();
                result.insert(name.clone(), folded);
            }
        }

        // overlay 2: metric-derived capacity values
        if let Some((prom_client, prom_config)) = &self.prometheus {
            for (name, query) in &prom_config.queries {
                let samples = prom_client.query(query).await?;
                let folded = fold_metric_samples(name, &samples, &self.real_azs)?;
                result.insert(
                    name.clone(),
                    folded
                        .into_iter()
                        .map(|(az, capacity)| {
                            (az, AZResourceCapacityReport { capacity, usage: None })
                        })
                        .collect(),
                );
            }
            if !prom_config.allow_zero_capacity {
                for name in prom_config.queries.keys() {
                    let total: u64 = result
                        .get(name)
                        .map(|per_az| per_az.values().map(|entry| entry.capacity).sum())
                        .unwrap_or(0);
                    if total == 0 {
                        return Err(ScrapeError::ZeroCapacityForbidden {
                            resource: name.to_string(),
                        });
                    }
                }
            }
        }

        Ok(result)
    }

    pub async fn apply_quota(
        &self,
        tx: &mut PgTransaction<'_>,
        project: &ProjectMetadata,
        quotas: BTreeMap<ResourceName, u64>,
    ) -> Result<(), ScrapeError> {
        let service_info = self.ensure_info(tx).await?;
        let request = QuotaRequest {
            resources: quotas
                .into_iter()
                .map(|(name, quota)| (name, QuotaRequestEntry { quota }))
                .collect(),
            project_metadata: service_info
                .flags
                .quota_update_needs_project_metadata
                .then(|| project.clone()),
        };
        self.client.put_quota(project.uuid, &request).await?;
        Ok(())
    }
}

/// Fold a per-AZ capacity report onto the configured AZ set: entries for
/// unknown AZs sum into the pseudo-AZ `unknown`; `any` survives for flat
/// resources.
fn fold_capacity(
    per_az: PerAZ<AZResourceCapacityReport>,
    real_azs: &[AvailabilityZone],
) -> PerAZ<AZResourceCapacityReport> {
    let mut result: PerAZ<AZResourceCapacityReport> = PerAZ::new();
    for (az, entry) in per_az {
        let target = if az.is_any() || real_azs.contains(&az) {
            az
        } else {
            AvailabilityZone::unknown()
        };
        let folded = result.entry_or_default(target);
        folded.capacity += entry.capacity;
        folded.usage = match (folded.usage, entry.usage) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
    }
    result
}

/// Turn metric samples into a per-AZ capacity map. Two samples for the same
/// known AZ is a protocol error; samples for undeclared AZs sum into
/// `unknown`.
fn fold_metric_samples(
    resource: &ResourceName,
    samples: &[AZSample],
    real_azs: &[AvailabilityZone],
) -> Result<PerAZ<u64>, ScrapeError> {
    let mut result: PerAZ<u64> = PerAZ::new();
    for sample in samples {
        let value = sample.value.max(0.0).round() as u64;
        let az = sample
            .az
            .as_deref()
            .map(AvailabilityZone::from)
            .unwrap_or_else(AvailabilityZone::unknown);
        if real_azs.contains(&az) {
            if result.contains(&az) {
                return Err(ScrapeError::DuplicateMetricSample {
                    resource: resource.to_string(),
                    az: az.to_string(),
                });
            }
            result.insert(az, value);
        } else {
            *result.entry_or_default(AvailabilityZone::unknown()) += value;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real_azs() -> Vec<AvailabilityZone> {
        vec![
            AvailabilityZone::new("az-one"),
            AvailabilityZone::new("az-two"),
        ]
    }

    fn sample(az: Option<&str>, value: f64) -> AZSample {
        AZSample {
            az: az.map(|s| s.to_string()),
            value,
        }
    }

    #[test]
    fn test_fold_metric_samples_known_and_unknown_azs() {
        let resource = ResourceName::from("cap");
        let samples = vec![
            sample(Some("az-one"), 100.0),
            sample(Some("az-two"), 200.0),
            sample(Some("foo"), 7.0),
        ];
        let folded = fold_metric_samples(&resource, &samples, &real_azs()).unwrap();
        assert_eq!(folded.get(&AvailabilityZone::new("az-one")).copied(), Some(100));
        assert_eq!(folded.get(&AvailabilityZone::new("az-two")).copied(), Some(200));
        assert_eq!(folded.get(&AvailabilityZone::unknown()).copied(), Some(7));
        assert!(folded.sum() > 0);
    }

    #[test]
    fn test_fold_metric_samples_duplicate_known_az_is_error() {
        let resource = ResourceName::from("cap");
        let samples = vec![
            sample(Some("az-one"), 100.0),
            sample(Some("az-one"), 50.0),
        ];
        let result = fold_metric_samples(&resource, &samples, &real_azs());
        assert!(matches!(
            result,
            Err(ScrapeError::DuplicateMetricSample { .. })
        ));
    }

    #[test]
    fn test_fold_metric_samples_duplicate_unknown_azs_sum() {
        let resource = ResourceName::from("cap");
        let samples = vec![
            sample(Some("foo"), 5.0),
            sample(Some("bar"), 6.0),
            sample(None, 1.0),
        ];
        let folded = fold_metric_samples(&resource, &samples, &real_azs()).unwrap();
        assert_eq!(folded.get(&AvailabilityZone::unknown()).copied(), Some(12));
    }

    #[test]
    fn test_fold_capacity_merges_usage() {
        let mut per_az = PerAZ::new();
        per_az.insert(
            AvailabilityZone::new("az-one"),
            AZResourceCapacityReport {
                capacity: 10,
                usage: Some(3),
            },
        );
        per_az.insert(
            AvailabilityZone::new("somewhere-else"),
            AZResourceCapacityReport {
                capacity: 5,
                usage: None,
            },
        );
        per_az.insert(
            AvailabilityZone::new("elsewhere"),
            AZResourceCapacityReport {
                capacity: 2,
                usage: Some(1),
            },
        );
        let folded = fold_capacity(per_az, &real_azs());
        let unknown = folded.get(&AvailabilityZone::unknown()).unwrap();
        assert_eq!(unknown.capacity, 7);
        assert_eq!(unknown.usage, Some(1));
        let az_one = folded.get(&AvailabilityZone::new("az-one")).unwrap();
        assert_eq!(az_one.capacity, 10);
        assert_eq!(az_one.usage, Some(3));
    }
}
