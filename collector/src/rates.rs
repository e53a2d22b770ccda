//! Rate scrape job. Shares the report-usage endpoint with the usage scrape
//! but runs on its own schedule and owns the opaque serialized state the
//! adapter uses for counter-reset detection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::cluster::Cluster;
use crate::scheduler::{next_due, Job, JobKind};
use crate::usage::{claim_project_service, record_scrape_failure};

pub struct RateScrapeJob {
    cluster: Arc<Cluster>,
    pub scrape_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl RateScrapeJob {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        RateScrapeJob {
            cluster,
            scrape_interval: Duration::from_secs(30 * 60),
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(60 * 60),
        }
    }
}

#[async_trait]
impl Job for RateScrapeJob {
    fn kind(&self) -> JobKind {
        JobKind::RateScrape
    }

    async fn poll_once(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut tx = self.cluster.pool.begin().await?;
        let Some(claimed) =
            claim_project_service(&mut tx, "next_rate_scrape_at", "rate_scrape_error_count")
                .await?
        else {
            return Ok(false);
        };

        let Some(connection) = self.cluster.connection(&claimed.service_type) else {
            sqlx::query("UPDATE project_services SET next_rate_scrape_at = $2 WHERE id = $1")
                .bind(claimed.id)
                .bind(next_due(now, self.scrape_interval))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(true);
        };

        let project = claimed.metadata();
        let prev_state = claimed.serialized_rate_state.clone();
        match connection.scrape_usage(&mut tx, &project, prev_state).await {
            Ok(report) => {
                for (rate_name, rate_report) in &report.rates {
                    // counters are monotonic; a lower value means the adapter
                    // restarted mid-window and is caught by its own state
                    sqlx::query(
                        r#"
                        INSERT INTO project_rates (project_service_id, name, usage_as_bigint)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (project_service_id, name) DO UPDATE
                        SET usage_as_bigint =
                            GREATEST(project_rates.usage_as_bigint, EXCLUDED.usage_as_bigint)
                        "#,
                    )
                    .bind(claimed.id)
                    .bind(rate_name.as_str())
                    .bind(rate_report.usage)
                    .execute(&mut *tx)
                    .await?;
                }

                sqlx::query(
                    r#"
                    UPDATE project_services
                    SET next_rate_scrape_at = $2, rate_scrape_error_count = 0,
                        serialized_rate_state = $3
                    WHERE id = $1
                    "#,
                )
                .bind(claimed.id)
                .bind(next_due(now, self.scrape_interval))
                .bind(&report.serialized_state)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                info!(
                    project = %project.uuid,
                    service = claimed.service_type.as_str(),
                    rates = report.rates.len(),
                    "rate scrape succeeded"
                );
                Ok(true)
            }
            Err(e) => {
                drop(tx);
                record_scrape_failure(
                    &self.cluster,
                    &claimed,
                    &e,
                    "next_rate_scrape_at",
                    "rate_scrape_error_count",
                    self.retry_base,
                    self.retry_max,
                )
                .await?;
                Ok(true)
            }
        }
    }
}
