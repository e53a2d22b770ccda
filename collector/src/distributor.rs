//! Quota distribution under the `autogrow` model.
//!
//! Pure computation first (desired quotas, tiered fair distribution with
//! the largest-remainder method), then a store-facing driver that loads
//! per-project demand, writes granted quotas and queues quota-apply jobs.
//! Runs after every capacity scrape and every usage scrape.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use shared::config::{AutogrowConfig, ClusterConfig};
use shared::models::UsageHistory;
use shared::types::{ResourceName, ServiceType};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

/// Everything the distributor needs to know about one project's standing on
/// one resource, in effective units.
#[derive(Debug, Clone, Default)]
pub struct ProjectDemand {
    pub project_uuid: Uuid,
    pub usage: u64,
    pub unused_commitments: u64,
    pub pending_commitments: u64,
    pub historical_max_usage: u64,
    pub min_quota: Option<u64>,
    pub max_quota: Option<u64>,
}

/// `desired = max(project_base_quota, ceil(hist * growth_multiplier),
/// hist + growth_minimum)`.
pub fn desired_quota(autogrow: &AutogrowConfig, historical_max_usage: u64) -> u64 {
    let grown = (historical_max_usage as f64 * autogrow.growth_multiplier).ceil() as u64;
    autogrow
        .project_base_quota
        .max(grown)
        .max(historical_max_usage + autogrow.growth_minimum)
}

fn clamp_quota(desired: u64, min_quota: Option<u64>, max_quota: Option<u64>) -> u64 {
    let mut quota = desired;
    if let Some(min) = min_quota {
        quota = quota.max(min);
    }
    if let Some(max) = max_quota {
        quota = quota.min(max);
    }
    quota
}

/// Distribute `total` units among the requests. When everything fits, every
/// request is granted in full. Under scarcity, grants follow the
/// largest-remainder method: exact proportional shares are floored, and the
/// remaining units go to the largest fractional remainders, ties broken by
/// ascending project UUID.
pub fn distribute_fairly(total: u64, requested: &BTreeMap<Uuid, u64>) -> BTreeMap<Uuid, u64> {
    let sum: u64 = requested.values().sum();
    if sum <= total {
        return requested.clone();
    }
    if total == 0 || sum == 0 {
        return requested.keys().map(|uuid| (*uuid, 0)).collect();
    }

    let mut granted: BTreeMap<Uuid, u64> = BTreeMap::new();
    let mut remainders: Vec<(Uuid, f64)> = Vec::with_capacity(requested.len());
    let mut distributed = 0u64;
    for (uuid, request) in requested {
        let exact = (*request as f64) * (total as f64) / (sum as f64);
        let floor = exact.floor() as u64;
        granted.insert(*uuid, floor);
        distributed += floor;
        remainders.push((*uuid, exact - floor as f64));
    }

    // hand out the leftover units, one each, to the largest remainders;
    // BTreeMap iteration already ordered ties by ascending UUID
    remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut leftover = total - distributed;
    for (uuid, _) in remainders {
        if leftover == 0 {
            break;
        }
        *granted.get_mut(&uuid).unwrap() += 1;
        leftover -= 1;
    }
    granted
}

/// Grant quotas for one resource. Demand is satisfied tier by tier (usage,
/// then unused commitments, then pending commitments, then the rest of the
/// desired quota), each tier distributed fairly while capacity lasts.
pub fn compute_quotas(
    autogrow: &AutogrowConfig,
    effective_capacity: u64,
    demands: &[ProjectDemand],
) -> BTreeMap<Uuid, u64> {
    let desired: BTreeMap<Uuid, u64> = demands
        .iter()
        .map(|demand| {
            let quota = clamp_quota(
                desired_quota(autogrow, demand.historical_max_usage),
                demand.min_quota,
                demand.max_quota,
            );
            (demand.project_uuid, quota)
        })
        .collect();
    let total_desired: u64 = desired.values().sum();

    // quota overcommit is allowed while the cluster is lightly allocated
    let allocated: u64 = demands.iter().map(|demand| demand.usage).sum();
    let pct = autogrow.allow_quota_overcommit_until_allocated_percent;
    let overcommit_allowed =
        pct > 0.0 && (allocated as f64) <= effective_capacity as f64 * pct / 100.0;
    if total_desired <= effective_capacity || overcommit_allowed {
        return desired;
    }

    // scarcity: satisfy demand tier by tier
    let mut granted: BTreeMap<Uuid, u64> = desired.keys().map(|uuid| (*uuid, 0)).collect();
    let mut remaining = effective_capacity;
    // the final tier asks for everything still missing from the desired
    // quota; the min() below caps each tier at that ceiling anyway
    let tiers: [fn(&ProjectDemand) -> u64; 4] = [
        |demand| demand.usage,
        |demand| demand.unused_commitments,
        |demand| demand.pending_commitments,
        |_| u64::MAX,
    ];

    for tier in &tiers {
        if remaining == 0 {
            break;
        }
        let requested: BTreeMap<Uuid, u64> = demands
            .iter()
            .map(|demand| {
                let so_far = granted[&demand.project_uuid];
                let request =
                    tier(demand).min(desired[&demand.project_uuid].saturating_sub(so_far));
                (demand.project_uuid, request)
            })
            .collect();
        let grants = distribute_fairly(remaining, &requested);
        for (uuid, grant) in grants {
            *granted.get_mut(&uuid).unwrap() += grant;
            remaining -= grant;
        }
    }
    granted
}

/// Drive the distribution for every autogrow-managed resource of a service.
pub async fn run_for_service(
    pool: &PgPool,
    config: &Arc<ClusterConfig>,
    service_type: &ServiceType,
) -> anyhow::Result<()> {
    let resource_names: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT cr.name FROM cluster_resources cr
        JOIN cluster_services cs ON cs.id = cr.service_id
        WHERE cs.service_type = $1 AND cr.has_quota
        ORDER BY cr.name
        "#,
    )
    .bind(service_type.as_str())
    .fetch_all(pool)
    .await?;

    for name in resource_names {
        let resource = ResourceName::from(name.as_str());
        if config.autogrow_for(service_type, &resource).is_some() {
            run_for_resource(pool, config, service_type, &resource).await?;
        }
    }
    Ok(())
}

/// Load demand, compute quotas, persist them and queue quota-apply for
/// projects whose granted quota differs from the backend's last-known one.
pub async fn run_for_resource(
    pool: &PgPool,
    config: &Arc<ClusterConfig>,
    service_type: &ServiceType,
    resource: &ResourceName,
) -> anyhow::Result<()> {
    let autogrow = match config.autogrow_for(service_type, resource) {
        Some(autogrow) => autogrow,
        None => return Ok(()),
    };
    let factor = config.behavior_for(service_type, resource).overcommit_factor;

    let raw_capacity: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(car.raw_capacity), 0)::BIGINT
        FROM cluster_az_resources car
        JOIN cluster_resources cr ON cr.id = car.resource_id
        JOIN cluster_services cs ON cs.id = cr.service_id
        WHERE cs.service_type = $1 AND cr.name = $2
        "#,
    )
    .bind(service_type.as_str())
    .bind(resource.as_str())
    .fetch_one(pool)
    .await?;
    let effective_capacity = factor.apply_to(raw_capacity.max(0) as u64);

    let demands = load_project_demand(pool, autogrow, service_type, resource).await?;
    if demands.is_empty() {
        return Ok(());
    }

    let quotas = compute_quotas(autogrow, effective_capacity, &demands);
    debug!(
        service = %service_type,
        resource = %resource,
        effective_capacity,
        projects = demands.len(),
        "distributed quotas"
    );

    let now = Utc::now();
    let mut desynced = 0u64;
    for (project_uuid, quota) in &quotas {
        sqlx::query(
            r#"
            UPDATE project_resources pr
            SET quota = $4
            FROM project_services ps, projects p
            WHERE pr.project_service_id = ps.id AND ps.project_id = p.id
              AND p.uuid = $1 AND ps.service_type = $2 AND pr.name = $3
              AND (pr.quota IS DISTINCT FROM $4)
            "#,
        )
        .bind(project_uuid)
        .bind(service_type.as_str())
        .bind(resource.as_str())
        .bind(*quota as i64)
        .execute(pool)
        .await?;

        // queue quota-apply when the granted value differs from what the
        // backend last acknowledged
        let updated = sqlx::query(
            r#"
            UPDATE project_services ps
            SET quota_desynced_at = COALESCE(ps.quota_desynced_at, $4)
            FROM projects p, project_resources pr
            WHERE ps.project_id = p.id AND pr.project_service_id = ps.id
              AND p.uuid = $1 AND ps.service_type = $2 AND pr.name = $3
              AND pr.quota IS DISTINCT FROM pr.backend_quota
            "#,
        )
        .bind(project_uuid)
        .bind(service_type.as_str())
        .bind(resource.as_str())
        .bind(now)
        .execute(pool)
        .await?;
        desynced += updated.rows_affected();
    }
    if desynced > 0 {
        info!(
            service = %service_type,
            resource = %resource,
            projects = desynced,
            "queued quota-apply for desynced projects"
        );
    }
    Ok(())
}

async fn load_project_demand(
    pool: &PgPool,
    autogrow: &AutogrowConfig,
    service_type: &ServiceType,
    resource: &ResourceName,
) -> anyhow::Result<Vec<ProjectDemand>> {
    let now = Utc::now();

    let rows = sqlx::query(
        r#"
        SELECT p.uuid AS project_uuid, pr.min_quota, pr.max_quota,
               par.usage, par.historical_usage_json
        FROM project_az_resources par
        JOIN project_resources pr ON pr.id = par.project_resource_id
        JOIN project_services ps ON ps.id = pr.project_service_id
        JOIN projects p ON p.id = ps.project_id
        WHERE ps.service_type = $1 AND pr.name = $2
        "#,
    )
    .bind(service_type.as_str())
    .bind(resource.as_str())
    .fetch_all(pool)
    .await?;

    let mut demands: BTreeMap<Uuid, ProjectDemand> = BTreeMap::new();
    for row in rows {
        let project_uuid: Uuid = row.try_get("project_uuid")?;
        let usage: i64 = row.try_get("usage")?;
        let history_json: Option<String> = row.try_get("historical_usage_json")?;
        let min_quota: Option<i64> = row.try_get("min_quota")?;
        let max_quota: Option<i64> = row.try_get("max_quota")?;

        let history = UsageHistory::from_json(history_json.as_deref());
        let historical_max =
            history.max_within(&autogrow.usage_data_retention_period, now);

        let demand = demands.entry(project_uuid).or_insert_with(|| ProjectDemand {
            project_uuid,
            min_quota: min_quota.map(|v| v.max(0) as u64),
            max_quota: max_quota.map(|v| v.max(0) as u64),
            ..ProjectDemand::default()
        });
        let usage = usage.max(0) as u64;
        demand.usage += usage;
        demand.historical_max_usage += historical_max.max(usage);
    }

    // commitments per project
    let rows = sqlx::query(
        r#"
        SELECT p.uuid AS project_uuid, c.state::text AS state,
               COALESCE(SUM(c.amount), 0)::BIGINT AS amount
        FROM commitments c
        JOIN projects p ON p.id = c.project_id
        JOIN cluster_az_resources car ON car.id = c.az_resource_id
        JOIN cluster_resources cr ON cr.id = car.resource_id
        JOIN cluster_services cs ON cs.id = cr.service_id
        WHERE cs.service_type = $1 AND cr.name = $2
          AND c.state IN ('active', 'pending')
        GROUP BY p.uuid, c.state
        "#,
    )
    .bind(service_type.as_str())
    .bind(resource.as_str())
    .fetch_all(pool)
    .await?;

    for row in rows {
        let project_uuid: Uuid = row.try_get("project_uuid")?;
        let state: String = row.try_get("state")?;
        let amount: i64 = row.try_get("amount")?;
        if let Some(demand) = demands.get_mut(&project_uuid) {
            match state.as_str() {
                "active" => {
                    demand.unused_commitments =
                        (amount.max(0) as u64).saturating_sub(demand.usage);
                }
                "pending" => demand.pending_commitments = amount.max(0) as u64,
                _ => {}
            }
        }
    }

    Ok(demands.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn autogrow(base: u64, multiplier: f64, minimum: u64) -> AutogrowConfig {
        AutogrowConfig {
            project_base_quota: base,
            growth_multiplier: multiplier,
            growth_minimum: minimum,
            allow_quota_overcommit_until_allocated_percent: 0.0,
            usage_data_retention_period: "30 days".parse().unwrap(),
        }
    }

    fn uuid(n: u8) -> Uuid {
        Uuid::from_u128(n as u128)
    }

    fn demand(n: u8, usage: u64, historical: u64) -> ProjectDemand {
        ProjectDemand {
            project_uuid: uuid(n),
            usage,
            historical_max_usage: historical,
            ..ProjectDemand::default()
        }
    }

    #[test]
    fn test_desired_quota_formula() {
        let cfg = autogrow(10, 1.2, 0);
        // max(10, ceil(40 * 1.2), 40 + 0) = 48
        assert_eq!(desired_quota(&cfg, 40), 48);
        // base quota dominates for tiny usage
        assert_eq!(desired_quota(&cfg, 0), 10);

        let cfg = autogrow(10, 1.0, 5);
        // growth minimum dominates: max(10, 40, 45) = 45
        assert_eq!(desired_quota(&cfg, 40), 45);
    }

    #[test]
    fn test_autogrow_confluence_under_capacity() {
        // two projects, capacity 100, growth 1.2, base quota 10,
        // historical usage 40 and 30: both get their desired quota
        let cfg = autogrow(10, 1.2, 0);
        let demands = vec![demand(1, 40, 40), demand(2, 30, 30)];
        let quotas = compute_quotas(&cfg, 100, &demands);
        assert_eq!(quotas[&uuid(1)], 48);
        assert_eq!(quotas[&uuid(2)], 36);
    }

    #[test]
    fn test_autogrow_over_subscription_largest_remainder() {
        // desired {96, 72}, capacity 100: exact shares 57.14 / 42.86,
        // the one leftover unit goes to the larger fractional remainder
        let cfg = autogrow(10, 1.2, 0);
        let demands = vec![demand(1, 80, 80), demand(2, 60, 60)];
        let quotas = compute_quotas(&cfg, 100, &demands);
        assert_eq!(quotas[&uuid(1)], 57);
        assert_eq!(quotas[&uuid(2)], 43);
        assert_eq!(quotas.values().sum::<u64>(), 100);
    }

    #[test]
    fn test_distribute_fairly_exact_sum_and_bounded_error() {
        let mut requested = BTreeMap::new();
        requested.insert(uuid(1), 11u64);
        requested.insert(uuid(2), 7);
        requested.insert(uuid(3), 5);
        requested.insert(uuid(4), 3);
        let total = 17u64;
        let granted = distribute_fairly(total, &requested);

        assert_eq!(granted.values().sum::<u64>(), total);
        let sum: u64 = requested.values().sum();
        for (uuid, request) in &requested {
            let exact = (*request as f64) * (total as f64) / (sum as f64);
            let diff = (granted[uuid] as f64 - exact).abs();
            assert!(diff < 1.0, "grant {} too far from exact {exact}", granted[uuid]);
        }
    }

    #[test]
    fn test_distribute_fairly_grants_all_when_capacity_suffices() {
        let mut requested = BTreeMap::new();
        requested.insert(uuid(1), 10u64);
        requested.insert(uuid(2), 20);
        assert_eq!(distribute_fairly(100, &requested), requested);
    }

    #[test]
    fn test_distribute_fairly_zero_total() {
        let mut requested = BTreeMap::new();
        requested.insert(uuid(1), 10u64);
        let granted = distribute_fairly(0, &requested);
        assert_eq!(granted[&uuid(1)], 0);
    }

    #[test]
    fn test_distribute_fairly_tie_broken_by_uuid() {
        // identical requests, one leftover unit: the smaller UUID wins
        let mut requested = BTreeMap::new();
        requested.insert(uuid(1), 3u64);
        requested.insert(uuid(2), 3);
        let granted = distribute_fairly(3, &requested);
        assert_eq!(granted[&uuid(1)], 2);
        assert_eq!(granted[&uuid(2)], 1);
    }

    #[test]
    fn test_tiers_prioritize_usage_over_commitments() {
        // capacity only covers usage; pending commitments get nothing
        let cfg = autogrow(0, 1.0, 0);
        let mut p1 = demand(1, 50, 50);
        p1.pending_commitments = 30;
        let mut p2 = demand(2, 50, 50);
        p2.pending_commitments = 30;
        let quotas = compute_quotas(&cfg, 100, &[p1, p2]);
        assert_eq!(quotas[&uuid(1)], 50);
        assert_eq!(quotas[&uuid(2)], 50);
    }

    #[test]
    fn test_min_max_overrides_clamp_desired() {
        let cfg = autogrow(10, 1.2, 0);
        let mut p1 = demand(1, 40, 40);
        p1.max_quota = Some(30);
        let mut p2 = demand(2, 0, 0);
        p2.min_quota = Some(25);
        let quotas = compute_quotas(&cfg, 1000, &[p1, p2]);
        assert_eq!(quotas[&uuid(1)], 30);
        assert_eq!(quotas[&uuid(2)], 25);
    }

    #[test]
    fn test_overcommit_until_allocated_percent() {
        // capacity 100, allocation 40 is under the 50% threshold, so the
        // desired total of 160 is granted even though it exceeds capacity
        let mut cfg = autogrow(80, 1.0, 0);
        cfg.allow_quota_overcommit_until_allocated_percent = 50.0;
        let demands = vec![demand(1, 20, 20), demand(2, 20, 20)];
        let quotas = compute_quotas(&cfg, 100, &demands);
        assert_eq!(quotas[&uuid(1)], 80);
        assert_eq!(quotas[&uuid(2)], 80);

        // once allocation crosses the threshold, scarcity distribution kicks in
        let demands = vec![demand(1, 60, 60), demand(2, 20, 20)];
        let quotas = compute_quotas(&cfg, 100, &demands);
        assert_eq!(quotas.values().sum::<u64>(), 100);
    }
}
