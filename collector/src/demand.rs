//! Demand backchannel.
//!
//! Adapters whose capacity depends on what the cluster is being asked for
//! declare `needs_resource_demand`; during capacity scrape the connection
//! calls back into this module, which aggregates current usage, unused
//! confirmed commitments and pending commitments across all projects and
//! converts from effective to raw units.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use shared::config::ClusterConfig;
use shared::liquid::ResourceDemand;
use shared::types::{AvailabilityZone, PerAZ, ResourceName, ServiceType};
use sqlx::{PgPool, Row};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DemandError {
    #[error("demand unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DemandSource: Send + Sync {
    /// Aggregated demand per AZ across all projects, in raw units.
    async fn demand_for(
        &self,
        service: &ServiceType,
        resource: &ResourceName,
    ) -> Result<PerAZ<ResourceDemand>, DemandError>;
}

/// The store-backed demand source used in production.
pub struct StoreDemandSource {
    pool: PgPool,
    config: Arc<ClusterConfig>,
}

impl StoreDemandSource {
    pub fn new(pool: PgPool, config: Arc<ClusterConfig>) -> Self {
        StoreDemandSource { pool, config }
    }
}

#[async_trait]
impl DemandSource for StoreDemandSource {
    async fn demand_for(
        &self,
        service: &ServiceType,
        resource: &ResourceName,
    ) -> Result<PerAZ<ResourceDemand>, DemandError> {
        let factor = self.config.behavior_for(service, resource).overcommit_factor;

        // usage per (project, az)
        let usage_rows = sqlx::query(
            r#"
            SELECT ps.project_id, par.az, par.usage
            FROM project_az_resources par
            JOIN project_resources pr ON pr.id = par.project_resource_id
            JOIN project_services ps ON ps.id = pr.project_service_id
            WHERE ps.service_type = $1 AND pr.name = $2
            "#,
        )
        .bind(service.as_str())
        .bind(resource.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DemandError::Unavailable(e.to_string()))?;

        // commitment sums per (project, az, state)
        let commitment_rows = sqlx::query(
            r#"
            SELECT c.project_id, car.az, c.state::text AS state,
                   COALESCE(SUM(c.amount), 0)::BIGINT AS amount
            FROM commitments c
            JOIN cluster_az_resources car ON car.id = c.az_resource_id
            JOIN cluster_resources cr ON cr.id = car.resource_id
            JOIN cluster_services cs ON cs.id = cr.service_id
            WHERE cs.service_type = $1 AND cr.name = $2
              AND c.state IN ('active', 'pending')
            GROUP BY c.project_id, car.az, c.state
            "#,
        )
        .bind(service.as_str())
        .bind(resource.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DemandError::Unavailable(e.to_string()))?;

        // per (project, az): usage, active commitments, pending commitments
        let mut per_project: BTreeMap<(i64, String), (u64, u64, u64)> = BTreeMap::new();
        for row in usage_rows {
            let project_id: i64 = read(&row, "project_id")?;
            let az: String = read(&row, "az")?;
            let usage: i64 = read(&row, "usage")?;
            per_project.entry((project_id, az)).or_default().0 = usage.max(0) as u64;
        }
        for row in commitment_rows {
            let project_id: i64 = read(&row, "project_id")?;
            let az: String = read(&row, "az")?;
            let state: String = read(&row, "state")?;
            let amount: i64 = read(&row, "amount")?;
            let entry = per_project.entry((project_id, az)).or_default();
            match state.as_str() {
                "active" => entry.1 = amount.max(0) as u64,
                "pending" => entry.2 = amount.max(0) as u64,
                _ => {}
            }
        }

        // aggregate over projects; an active commitment only counts as
        // unused demand for the part its project is not already using
        let mut result: PerAZ<ResourceDemand> = PerAZ::new();
        for ((_, az), (usage, active, pending)) in per_project {
            let entry = result.entry_or_default(AvailabilityZone::new(az));
            entry.add(ResourceDemand {
                usage,
                unused_commitments: active.saturating_sub(usage),
                pending_commitments: pending,
            });
        }

        // effective units in the store, raw units on the wire
        let result = result
            .into_iter()
            .map(|(az, demand)| {
                (
                    az,
                    ResourceDemand {
                        usage: factor.apply_in_reverse_to(demand.usage),
                        unused_commitments: factor.apply_in_reverse_to(demand.unused_commitments),
                        pending_commitments: factor.apply_in_reverse_to(demand.pending_commitments),
                    },
                )
            })
            .collect();
        Ok(result)
    }
}

fn read<'r, T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>>(
    row: &'r sqlx::postgres::PgRow,
    column: &str,
) -> Result<T, DemandError> {
    row.try_get(column)
        .map_err(|e| DemandError::Unavailable(format!("column {column}: {e}")))
}
