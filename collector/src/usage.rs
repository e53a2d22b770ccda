//! Usage scrape job: one (project, service) pair per claim, serialized by
//! the `project_services` row lock. Persists per-AZ usage, backend quota
//! observations and the retained usage history the distributor feeds on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared::liquid::{AZResourceUsageReport, DomainMetadata, ProjectMetadata, UsageReport};
use shared::types::{AvailabilityZone, PerAZ, ServiceType};
use sqlx::FromRow;
use tracing::{error, info};
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::connection::ScrapeError;
use crate::distributor;
use crate::metrics;
use crate::reconcile::PgTransaction;
use crate::scheduler::{next_due, retry_due, Job, JobKind};

/// Row claimed by the usage and rate scrape jobs.
#[derive(Debug, FromRow)]
pub struct ClaimedProjectService {
    pub id: i64,
    pub service_type: String,
    pub error_count: i32,
    pub serialized_rate_state: Option<String>,
    pub uuid: Uuid,
    pub name: String,
    pub domain_uuid: Uuid,
    pub domain_name: String,
}

impl ClaimedProjectService {
    pub fn metadata(&self) -> ProjectMetadata {
        ProjectMetadata {
            uuid: self.uuid,
            name: self.name.clone(),
            domain: DomainMetadata {
                uuid: self.domain_uuid,
                name: self.domain_name.clone(),
            },
        }
    }
}

/// Claim one due (project, service) pair; `due_column` and `count_column`
/// select between the usage and rate scrape schedules.
pub async fn claim_project_service(
    tx: &mut PgTransaction<'_>,
    due_column: &str,
    count_column: &str,
) -> Result<Option<ClaimedProjectService>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT ps.id, ps.service_type, ps.{count_column} AS error_count,
               ps.serialized_rate_state,
               p.uuid, p.name, p.domain_uuid, p.domain_name
        FROM project_services ps
        JOIN projects p ON p.id = ps.project_id
        WHERE ps.{due_column} <= $1
        ORDER BY ps.{due_column}
        LIMIT 1
        FOR UPDATE OF ps SKIP LOCKED
        "#
    );
    sqlx::query_as(&query)
        .bind(Utc::now())
        .fetch_optional(&mut **tx)
        .await
}

pub struct UsageScrapeJob {
    cluster: Arc<Cluster>,
    pub scrape_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl UsageScrapeJob {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        UsageScrapeJob {
            cluster,
            scrape_interval: Duration::from_secs(30 * 60),
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(60 * 60),
        }
    }
}

#[async_trait]
impl Job for UsageScrapeJob {
    fn kind(&self) -> JobKind {
        JobKind::UsageScrape
    }

    async fn poll_once(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut tx = self.cluster.pool.begin().await?;
        let Some(claimed) =
            claim_project_service(&mut tx, "next_scrape_at", "scrape_error_count").await?
        else {
            return Ok(false);
        };

        let Some(connection) = self.cluster.connection(&claimed.service_type) else {
            sqlx::query("UPDATE project_services SET next_scrape_at = $2 WHERE id = $1")
                .bind(claimed.id)
                .bind(next_due(now, self.scrape_interval))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(true);
        };

        let project = claimed.metadata();
        match connection.scrape_usage(&mut tx, &project, None).await {
            Ok(report) => {
                persist_usage(&mut tx, &self.cluster, &claimed, &report).await?;
                sqlx::query(
                    r#"
                    UPDATE project_services
                    SET next_scrape_at = $2, scrape_error_count = 0
                    WHERE id = $1
                    "#,
                )
                .bind(claimed.id)
                .bind(next_due(now, self.scrape_interval))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                info!(
                    project = %project.uuid,
                    service = claimed.service_type.as_str(),
                    "usage scrape succeeded"
                );

                distributor::run_for_service(
                    &self.cluster.pool,
                    &self.cluster.config,
                    &ServiceType::from(claimed.service_type.as_str()),
                )
                .await?;
                Ok(true)
            }
            Err(e) => {
                drop(tx);
                record_scrape_failure(
                    &self.cluster,
                    &claimed,
                    &e,
                    "next_scrape_at",
                    "scrape_error_count",
                    self.retry_base,
                    self.retry_max,
                )
                .await?;
                Ok(true)
            }
        }
    }
}

pub async fn record_scrape_failure(
    cluster: &Cluster,
    claimed: &ClaimedProjectService,
    error: &ScrapeError,
    due_column: &str,
    count_column: &str,
    retry_base: Duration,
    retry_max: Duration,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let error_count = claimed.error_count.saturating_add(1);
    error!(
        project = %claimed.uuid,
        service = claimed.service_type.as_str(),
        error = %error,
        error_count,
        "scrape failed"
    );
    metrics::SCRAPE_FAILURES
        .with_label_values(&[&claimed.service_type, error.class()])
        .inc();
    if error.is_protocol_mismatch() {
        metrics::PROTOCOL_MISMATCHES
            .with_label_values(&[&claimed.service_type])
            .inc();
    }

    let query = format!(
        "UPDATE project_services SET {due_column} = $2, {count_column} = $3 WHERE id = $1"
    );
    sqlx::query(&query)
        .bind(claimed.id)
        .bind(retry_due(now, retry_base, retry_max, error_count))
        .bind(error_count)
        .execute(&cluster.pool)
        .await?;
    Ok(())
}

async fn persist_usage(
    tx: &mut PgTransaction<'_>,
    cluster: &Cluster,
    claimed: &ClaimedProjectService,
    report: &UsageReport,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let service_type = ServiceType::from(claimed.service_type.as_str());
    let real_azs = &cluster.config.availability_zones;

    for (resource_name, resource_report) in &report.resources {
        sqlx::query(
            r#"
            INSERT INTO project_resources (project_service_id, name)
            VALUES ($1, $2)
            ON CONFLICT (project_service_id, name) DO NOTHING
            "#,
        )
        .bind(claimed.id)
        .bind(resource_name.as_str())
        .execute(&mut **tx)
        .await?;
        let resource_id: i64 = sqlx::query_scalar(
            "SELECT id FROM project_resources WHERE project_service_id = $1 AND name = $2",
        )
        .bind(claimed.id)
        .bind(resource_name.as_str())
        .fetch_one(&mut **tx)
        .await?;

        if let Some(backend_quota) = resource_report.quota {
            sqlx::query("UPDATE project_resources SET backend_quota = $2 WHERE id = $1")
                .bind(resource_id)
                .bind(backend_quota)
                .execute(&mut **tx)
                .await?;
        }

        let retention = cluster
            .config
            .autogrow_for(&service_type, resource_name)
            .map(|autogrow| autogrow.usage_data_retention_period);

        for (az, entry) in fold_usage(resource_report.per_az.clone(), real_azs).iter() {
            let history_json: Option<Option<String>> = sqlx::query_scalar(
                r#"
                SELECT historical_usage_json FROM project_az_resources
                WHERE project_resource_id = $1 AND az = $2
                "#,
            )
            .bind(resource_id)
            .bind(az.as_str())
            .fetch_optional(&mut **tx)
            .await?;

            let new_history = retention.map(|retention| {
                let mut history = shared::models::UsageHistory::from_json(
                    history_json.flatten().as_deref(),
                );
                history.record(now, entry.usage, &retention);
                history.to_json()
            });

            sqlx::query(
                r#"
                INSERT INTO project_az_resources
                    (project_resource_id, az, usage, physical_usage, historical_usage_json)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (project_resource_id, az) DO UPDATE
                SET usage = EXCLUDED.usage,
                    physical_usage = EXCLUDED.physical_usage,
                    historical_usage_json =
                        COALESCE(EXCLUDED.historical_usage_json,
                                 project_az_resources.historical_usage_json)
                "#,
            )
            .bind(resource_id)
            .bind(az.as_str())
            .bind(entry.usage as i64)
            .bind(entry.physical_usage.map(|u| u as i64))
            .bind(new_history)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

/// Fold a per-AZ usage report onto the configured AZ set, like capacity
/// folding: undeclared AZs sum into `unknown`, `any` survives.
fn fold_usage(
    per_az: PerAZ<AZResourceUsageReport>,
    real_azs: &[AvailabilityZone],
) -> PerAZ<AZResourceUsageReport> {
    let mut result: PerAZ<AZResourceUsageReport> = PerAZ::new();
    for (az, entry) in per_az {
        let target = if az.is_any() || real_azs.contains(&az) {
            az
        } else {
            AvailabilityZone::unknown()
        };
        let folded = result.entry_or_default(target);
        folded.usage += entry.usage;
        folded.physical_usage = match (folded.physical_usage, entry.physical_usage) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_usage_folds_undeclared_azs() {
        let real = vec![AvailabilityZone::new("az-one")];
        let mut per_az = PerAZ::new();
        per_az.insert(
            AvailabilityZone::new("az-one"),
            AZResourceUsageReport {
                usage: 10,
                physical_usage: Some(8),
            },
        );
        per_az.insert(
            AvailabilityZone::new("az-gone"),
            AZResourceUsageReport {
                usage: 4,
                physical_usage: None,
            },
        );
        let folded = fold_usage(per_az, &real);
        assert_eq!(folded.get(&AvailabilityZone::new("az-one")).unwrap().usage, 10);
        assert_eq!(folded.get(&AvailabilityZone::unknown()).unwrap().usage, 4);
    }

    #[test]
    fn test_project_metadata_from_claim() {
        let claimed = ClaimedProjectService {
            id: 1,
            service_type: "compute".to_string(),
            error_count: 0,
            serialized_rate_state: None,
            uuid: Uuid::from_u128(7),
            name: "tenant-a".to_string(),
            domain_uuid: Uuid::from_u128(8),
            domain_name: "domain-a".to_string(),
        };
        let metadata = claimed.metadata();
        assert_eq!(metadata.uuid, Uuid::from_u128(7));
        assert_eq!(metadata.domain.name, "domain-a");
    }
}
