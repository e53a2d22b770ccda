//! Capacity scrape job.
//!
//! Claims one due service at a time (the service row lock globally
//! serializes capacity scrapes per service), runs the adapter's capacity
//! report with overlays and the demand backchannel, persists per-AZ raw
//! capacities, then hands the service to the quota distributor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared::liquid::AZResourceCapacityReport;
use shared::types::{PerAZ, ResourceName, ServiceType};
use sqlx::Row;
use tracing::{error, info, warn};

use crate::cluster::Cluster;
use crate::connection::ScrapeError;
use crate::demand::DemandSource;
use crate::distributor;
use crate::metrics;
use crate::reconcile::PgTransaction;
use crate::scheduler::{next_due, retry_due, Job, JobKind};

pub struct CapacityScrapeJob {
    cluster: Arc<Cluster>,
    demand_source: Arc<dyn DemandSource>,
    pub scrape_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl CapacityScrapeJob {
    pub fn new(cluster: Arc<Cluster>, demand_source: Arc<dyn DemandSource>) -> Self {
        CapacityScrapeJob {
            cluster,
            demand_source,
            scrape_interval: Duration::from_secs(15 * 60),
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(60 * 60),
        }
    }
}

#[async_trait]
impl Job for CapacityScrapeJob {
    fn kind(&self) -> JobKind {
        JobKind::CapacityScrape
    }

    async fn poll_once(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut tx = self.cluster.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, service_type, capacity_scrape_error_count
            FROM cluster_services
            WHERE next_capacity_scrape_at <= $1
            ORDER BY next_capacity_scrape_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let service_id: i64 = row.try_get("id")?;
        let service_type: String = row.try_get("service_type")?;
        let error_count: i32 = row.try_get("capacity_scrape_error_count")?;

        let Some(connection) = self.cluster.connection(&service_type) else {
            // should have been removed by the orphan sweep
            warn!(service = service_type.as_str(), "no adapter configured, skipping");
            sqlx::query(
                "UPDATE cluster_services SET next_capacity_scrape_at = $2 WHERE id = $1",
            )
            .bind(service_id)
            .bind(next_due(now, self.scrape_interval))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(true);
        };

        match connection
            .scrape_capacity(&mut tx, self.demand_source.as_ref())
            .await
        {
            Ok(capacities) => {
                persist_capacity(&mut tx, service_id, &service_type, &capacities).await?;
                sqlx::query(
                    r#"
                    UPDATE cluster_services
                    SET next_capacity_scrape_at = $2, capacity_scrape_error_count = 0
                    WHERE id = $1
                    "#,
                )
                .bind(service_id)
                .bind(next_due(now, self.scrape_interval))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                info!(service = service_type.as_str(), "capacity scrape succeeded");

                // quotas shift whenever capacity does
                distributor::run_for_service(
                    &self.cluster.pool,
                    &self.cluster.config,
                    &ServiceType::from(service_type.as_str()),
                )
                .await?;
                Ok(true)
            }
            Err(e) => {
                // the transaction may already be poisoned by a store error,
                // so bookkeeping happens on a fresh connection
                drop(tx);
                record_failure(self, service_id, &service_type, error_count, &e).await?;
                Ok(true)
            }
        }
    }
}

async fn record_failure(
    job: &CapacityScrapeJob,
    service_id: i64,
    service_type: &str,
    error_count: i32,
    error: &ScrapeError,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let error_count = error_count.saturating_add(1);
    error!(
        service = service_type,
        error = %error,
        error_count,
        "capacity scrape failed"
    );
    metrics::SCRAPE_FAILURES
        .with_label_values(&[service_type, error.class()])
        .inc();
    if error.is_protocol_mismatch() {
        metrics::PROTOCOL_MISMATCHES
            .with_label_values(&[service_type])
            .inc();
    }

    sqlx::query(
        r#"
        UPDATE cluster_services
        SET next_capacity_scrape_at = $2, capacity_scrape_error_count = $3
        WHERE id = $1
        "#,
    )
    .bind(service_id)
    .bind(retry_due(now, job.retry_base, job.retry_max, error_count))
    .bind(error_count)
    .execute(&job.cluster.pool)
    .await?;
    Ok(())
}

async fn persist_capacity(
    tx: &mut PgTransaction<'_>,
    service_id: i64,
    service_type: &str,
    capacities: &BTreeMap<ResourceName, PerAZ<AZResourceCapacityReport>>,
) -> anyhow::Result<()> {
    for (resource_name, per_az) in capacities {
        let resource_id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM cluster_resources WHERE service_id = $1 AND name = $2",
        )
        .bind(service_id)
        .bind(resource_name.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        let Some(resource_id) = resource_id else {
            // overlays may name resources the adapter does not advertise
            warn!(
                service = service_type,
                resource = %resource_name,
                "capacity reported for unknown resource, ignoring"
            );
            continue;
        };

        for (az, entry) in per_az.iter() {
            sqlx::query(
                r#"
                INSERT INTO cluster_az_resources (resource_id, az, raw_capacity, usage, last_nonzero_raw_capacity)
                VALUES ($1, $2, $3, $4, NULLIF($3, 0))
                ON CONFLICT (resource_id, az) DO UPDATE
                SET raw_capacity = EXCLUDED.raw_capacity,
                    usage = COALESCE($5, cluster_az_resources.usage),
                    last_nonzero_raw_capacity = COALESCE(
                        NULLIF(EXCLUDED.raw_capacity, 0),
                        cluster_az_resources.last_nonzero_raw_capacity)
                "#,
            )
            .bind(resource_id)
            .bind(az.as_str())
            .bind(entry.capacity as i64)
            .bind(entry.usage.unwrap_or(0) as i64)
            .bind(entry.usage.map(|u| u as i64))
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}
