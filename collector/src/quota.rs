//! Quota apply job. Drains (project, service) pairs whose granted quotas
//! differ from what the backend last acknowledged, marked by
//! `quota_desynced_at`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared::types::ResourceName;
use sqlx::Row;
use tracing::{error, info};

use crate::client::LiquidError;
use crate::cluster::Cluster;
use crate::connection::ScrapeError;
use crate::metrics;
use crate::scheduler::{retry_due, Job, JobKind};
use crate::usage::{claim_project_service, ClaimedProjectService};

pub struct QuotaApplyJob {
    cluster: Arc<Cluster>,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl QuotaApplyJob {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        QuotaApplyJob {
            cluster,
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(60 * 60),
        }
    }
}

#[async_trait]
impl Job for QuotaApplyJob {
    fn kind(&self) -> JobKind {
        JobKind::QuotaApply
    }

    async fn poll_once(&self) -> anyhow::Result<bool> {
        let mut tx = self.cluster.pool.begin().await?;
        let Some(claimed) =
            claim_project_service(&mut tx, "quota_desynced_at", "quota_sync_error_count").await?
        else {
            return Ok(false);
        };

        let Some(connection) = self.cluster.connection(&claimed.service_type) else {
            sqlx::query("UPDATE project_services SET quota_desynced_at = NULL WHERE id = $1")
                .bind(claimed.id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(true);
        };

        // only resources the backend takes quota for
        let rows = sqlx::query(
            r#"
            SELECT pr.name, pr.quota
            FROM project_resources pr
            JOIN project_services ps ON ps.id = pr.project_service_id
            JOIN cluster_services cs ON cs.service_type = ps.service_type
            JOIN cluster_resources cr ON cr.service_id = cs.id AND cr.name = pr.name
            WHERE pr.project_service_id = $1 AND cr.has_quota AND pr.quota IS NOT NULL
            ORDER BY pr.name
            "#,
        )
        .bind(claimed.id)
        .fetch_all(&mut *tx)
        .await?;

        let mut quotas: BTreeMap<ResourceName, u64> = BTreeMap::new();
        for row in &rows {
            let name: String = row.try_get("name")?;
            let quota: i64 = row.try_get("quota")?;
            // negative quota means infinite
            let quota = if quota < 0 { u64::MAX } else { quota as u64 };
            quotas.insert(ResourceName::from(name.as_str()), quota);
        }
        if quotas.is_empty() {
            sqlx::query("UPDATE project_services SET quota_desynced_at = NULL WHERE id = $1")
                .bind(claimed.id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(true);
        }

        let project = claimed.metadata();
        match connection.apply_quota(&mut tx, &project, quotas).await {
            Ok(()) => {
                sqlx::query(
                    r#"
                    UPDATE project_resources SET backend_quota = quota
                    WHERE project_service_id = $1 AND quota IS NOT NULL
                    "#,
                )
                .bind(claimed.id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    r#"
                    UPDATE project_services
                    SET quota_desynced_at = NULL, quota_sync_error_count = 0
                    WHERE id = $1
                    "#,
                )
                .bind(claimed.id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                info!(
                    project = %project.uuid,
                    service = claimed.service_type.as_str(),
                    "quota applied"
                );
                Ok(true)
            }
            Err(e) => {
                drop(tx);
                record_apply_failure(self, &claimed, &e).await?;
                Ok(true)
            }
        }
    }
}

async fn record_apply_failure(
    job: &QuotaApplyJob,
    claimed: &ClaimedProjectService,
    error: &ScrapeError,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let error_count = claimed.error_count.saturating_add(1);
    error!(
        project = %claimed.uuid,
        service = claimed.service_type.as_str(),
        error = %error,
        error_count,
        "quota apply failed"
    );
    if matches!(error, ScrapeError::Liquid(LiquidError::QuotaRejected(_))) {
        metrics::QUOTA_REJECTIONS
            .with_label_values(&[&claimed.service_type])
            .inc();
    } else {
        metrics::SCRAPE_FAILURES
            .with_label_values(&[&claimed.service_type, error.class()])
            .inc();
    }

    // keep the desync marker, pushed into the future by the backoff
    sqlx::query(
        r#"
        UPDATE project_services
        SET quota_desynced_at = $2, quota_sync_error_count = $3
        WHERE id = $1
        "#,
    )
    .bind(claimed.id)
    .bind(retry_due(now, job.retry_base, job.retry_max, error_count))
    .bind(error_count)
    .execute(&job.cluster.pool)
    .await?;
    Ok(())
}
