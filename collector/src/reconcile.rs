//! Catalog reconciliation.
//!
//! Keeps the `cluster_services` sub-tree (resources, AZ rows, rates) in sync
//! with the latest `ServiceInfo`. All child rows are written first and
//! stamped with the new `liquid_version`; the parent's version bump is the
//! last statement, so a crash mid-way leaves a tree the next reconcile will
//! repair.

use std::collections::BTreeMap;

use shared::liquid::ServiceInfo;
use shared::models::Topology;
use shared::types::{AvailabilityZone, RateName, ResourceName};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

pub type PgTransaction<'c> = Transaction<'c, Postgres>;

/// Result of comparing an existing key set against a desired one: the
/// set-update primitive inserts the missing keys, updates the shared ones in
/// place and deletes the extra ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<K> {
    pub to_insert: Vec<K>,
    pub to_update: Vec<K>,
    pub to_delete: Vec<K>,
}

impl<K> Default for SetDiff<K> {
    fn default() -> Self {
        SetDiff {
            to_insert: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
        }
    }
}

pub fn diff_keys<K: Ord + Clone>(existing: &[K], desired: &[K]) -> SetDiff<K> {
    let mut diff = SetDiff::default();
    for key in desired {
        if existing.contains(key) {
            diff.to_update.push(key.clone());
        } else {
            diff.to_insert.push(key.clone());
        }
    }
    for key in existing {
        if !desired.contains(key) {
            diff.to_delete.push(key.clone());
        }
    }
    diff.to_insert.sort();
    diff.to_update.sort();
    diff.to_delete.sort();
    diff
}

/// The AZ rows a resource must have: flat resources live entirely in the
/// pseudo-AZ `any`; AZ-aware resources have one row per real AZ plus
/// `unknown` for samples that cannot be attributed.
pub fn desired_azs(topology: Topology, real_azs: &[AvailabilityZone]) -> Vec<String> {
    match topology {
        Topology::Flat => vec![AvailabilityZone::ANY.to_string()],
        Topology::AzAware => {
            let mut azs: Vec<String> =
                real_azs.iter().map(|az| az.as_str().to_string()).collect();
            azs.push(AvailabilityZone::UNKNOWN.to_string());
            azs.sort();
            azs
        }
    }
}

/// Reconcile the full catalog sub-tree of one service inside the caller's
/// transaction.
pub async fn reconcile_service(
    tx: &mut PgTransaction<'_>,
    service_type: &str,
    real_azs: &[AvailabilityZone],
    service_info: &ServiceInfo,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO cluster_services (service_type, liquid_version)
        VALUES ($1, 0)
        ON CONFLICT (service_type) DO NOTHING
        "#,
    )
    .bind(service_type)
    .execute(&mut **tx)
    .await?;

    let service_id: i64 =
        sqlx::query_scalar("SELECT id FROM cluster_services WHERE service_type = $1")
            .bind(service_type)
            .fetch_one(&mut **tx)
            .await?;

    reconcile_resources(tx, service_id, real_azs, service_info).await?;
    reconcile_rates(tx, service_id, service_info).await?;

    // version bump last: everything before this is invisible to readers that
    // check child liquid_version against the parent
    sqlx::query(
        r#"
        UPDATE cluster_services
        SET liquid_version = $2,
            usage_metric_families_json = $3,
            capacity_metric_families_json = $4
        WHERE id = $1
        "#,
    )
    .bind(service_id)
    .bind(service_info.version)
    .bind(&service_info.usage_metric_families)
    .bind(&service_info.capacity_metric_families)
    .execute(&mut **tx)
    .await?;

    info!(
        service = service_type,
        liquid_version = service_info.version,
        resources = service_info.resources.len(),
        rates = service_info.rates.len(),
        "catalog reconciled"
    );
    Ok(())
}

async fn reconcile_resources(
    tx: &mut PgTransaction<'_>,
    service_id: i64,
    real_azs: &[AvailabilityZone],
    service_info: &ServiceInfo,
) -> Result<(), sqlx::Error> {
    let existing: Vec<String> =
        sqlx::query_scalar("SELECT name FROM cluster_resources WHERE service_id = $1")
            .bind(service_id)
            .fetch_all(&mut **tx)
            .await?;
    let desired: Vec<String> = service_info
        .resources
        .keys()
        .map(|name| name.as_str().to_string())
        .collect();
    let diff = diff_keys(&existing, &desired);
    debug!(
        service_id,
        inserts = diff.to_insert.len(),
        updates = diff.to_update.len(),
        deletes = diff.to_delete.len(),
        "reconciling cluster_resources"
    );

    // deletions cascade to cluster_az_resources and precede the version bump
    if !diff.to_delete.is_empty() {
        sqlx::query("DELETE FROM cluster_resources WHERE service_id = $1 AND name = ANY($2)")
            .bind(service_id)
            .bind(&diff.to_delete)
            .execute(&mut **tx)
            .await?;
    }

    for name in &diff.to_insert {
        let key = ResourceName::from(name.as_str());
        let res_info = &service_info.resources[&key];
        sqlx::query(
            r#"
            INSERT INTO cluster_resources
                (service_id, name, liquid_version, unit, topology,
                 has_capacity, needs_resource_demand, has_quota, attributes_json)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(service_id)
        .bind(name)
        .bind(service_info.version)
        .bind(res_info.unit.as_str())
        .bind(res_info.topology)
        .bind(res_info.has_capacity)
        .bind(res_info.needs_resource_demand)
        .bind(res_info.has_quota)
        .bind(&res_info.attributes)
        .execute(&mut **tx)
        .await?;
    }

    for name in &diff.to_update {
        let key = ResourceName::from(name.as_str());
        let res_info = &service_info.resources[&key];
        sqlx::query(
            r#"
            UPDATE cluster_resources
            SET liquid_version = $3, unit = $4, topology = $5,
                has_capacity = $6, needs_resource_demand = $7, has_quota = $8,
                attributes_json = $9
            WHERE service_id = $1 AND name = $2
            "#,
        )
        .bind(service_id)
        .bind(name)
        .bind(service_info.version)
        .bind(res_info.unit.as_str())
        .bind(res_info.topology)
        .bind(res_info.has_capacity)
        .bind(res_info.needs_resource_demand)
        .bind(res_info.has_quota)
        .bind(&res_info.attributes)
        .execute(&mut **tx)
        .await?;
    }

    // AZ rows per surviving resource
    let rows = sqlx::query("SELECT id, name, topology FROM cluster_resources WHERE service_id = $1")
        .bind(service_id)
        .fetch_all(&mut **tx)
        .await?;
    let mut resource_ids = BTreeMap::new();
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        let topology: Topology = row.try_get("topology")?;
        resource_ids.insert(name, (id, topology));
    }

    for (resource_id, topology) in resource_ids.values() {
        reconcile_az_rows(tx, *resource_id, desired_azs(*topology, real_azs)).await?;
    }
    Ok(())
}

async fn reconcile_az_rows(
    tx: &mut PgTransaction<'_>,
    resource_id: i64,
    desired: Vec<String>,
) -> Result<(), sqlx::Error> {
    let existing: Vec<String> =
        sqlx::query_scalar("SELECT az FROM cluster_az_resources WHERE resource_id = $1")
            .bind(resource_id)
            .fetch_all(&mut **tx)
            .await?;
    let diff = diff_keys(&existing, &desired);

    if !diff.to_delete.is_empty() {
        sqlx::query("DELETE FROM cluster_az_resources WHERE resource_id = $1 AND az = ANY($2)")
            .bind(resource_id)
            .bind(&diff.to_delete)
            .execute(&mut **tx)
            .await?;
    }
    for az in &diff.to_insert {
        sqlx::query(
            r#"
            INSERT INTO cluster_az_resources (resource_id, az, raw_capacity, usage)
            VALUES ($1, $2, 0, 0)
            "#,
        )
        .bind(resource_id)
        .bind(az)
        .execute(&mut **tx)
        .await?;
    }
    // shared AZ rows keep their capacity and usage
    Ok(())
}

async fn reconcile_rates(
    tx: &mut PgTransaction<'_>,
    service_id: i64,
    service_info: &ServiceInfo,
) -> Result<(), sqlx::Error> {
    let existing: Vec<String> =
        sqlx::query_scalar("SELECT name FROM cluster_rates WHERE service_id = $1")
            .bind(service_id)
            .fetch_all(&mut **tx)
            .await?;
    let desired: Vec<String> = service_info
        .rates
        .keys()
        .map(|name| name.as_str().to_string())
        .collect();
    let diff = diff_keys(&existing, &desired);

    if !diff.to_delete.is_empty() {
        sqlx::query("DELETE FROM cluster_rates WHERE service_id = $1 AND name = ANY($2)")
            .bind(service_id)
            .bind(&diff.to_delete)
            .execute(&mut **tx)
            .await?;
    }
    for name in &diff.to_insert {
        let key = RateName::from(name.as_str());
        let rate_info = &service_info.rates[&key];
        sqlx::query(
            r#"
            INSERT INTO cluster_rates (service_id, name, liquid_version, unit, has_usage)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(service_id)
        .bind(name)
        .bind(service_info.version)
        .bind(rate_info.unit.as_str())
        .bind(rate_info.has_usage)
        .execute(&mut **tx)
        .await?;
    }
    for name in &diff.to_update {
        let key = RateName::from(name.as_str());
        let rate_info = &service_info.rates[&key];
        sqlx::query(
            r#"
            UPDATE cluster_rates
            SET liquid_version = $3, unit = $4, has_usage = $5
            WHERE service_id = $1 AND name = $2
            "#,
        )
        .bind(service_id)
        .bind(name)
        .bind(service_info.version)
        .bind(rate_info.unit.as_str())
        .bind(rate_info.has_usage)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Delete catalog and scheduler rows for services that are no longer
/// configured. Runs once at startup, before any job is spawned.
pub async fn orphan_sweep(pool: &PgPool, enabled_services: &[String]) -> Result<(), sqlx::Error> {
    let deleted = sqlx::query("DELETE FROM cluster_services WHERE service_type <> ALL($1)")
        .bind(enabled_services)
        .execute(pool)
        .await?
        .rows_affected();
    let deleted_project = sqlx::query("DELETE FROM project_services WHERE service_type <> ALL($1)")
        .bind(enabled_services)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted > 0 || deleted_project > 0 {
        info!(
            cluster_services = deleted,
            project_services = deleted_project,
            "orphan sweep removed rows for unconfigured services"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::liquid::{ResourceInfo, ServiceInfoFlags};
    use shared::types::Unit;
    use std::collections::BTreeMap as Map;

    fn keys(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_keys_basic() {
        let diff = diff_keys(&keys(&["a", "b", "c"]), &keys(&["b", "c", "d"]));
        assert_eq!(diff.to_insert, keys(&["d"]));
        assert_eq!(diff.to_update, keys(&["b", "c"]));
        assert_eq!(diff.to_delete, keys(&["a"]));
    }

    #[test]
    fn test_diff_keys_idempotent() {
        // applying the same desired set twice yields no inserts/deletes the
        // second time
        let existing = keys(&["a", "b"]);
        let desired = keys(&["b", "c"]);
        let first = diff_keys(&existing, &desired);

        let after_first: Vec<String> = {
            let mut rows = existing.clone();
            rows.retain(|k| !first.to_delete.contains(k));
            rows.extend(first.to_insert.clone());
            rows.sort();
            rows
        };
        let second = diff_keys(&after_first, &desired);
        assert!(second.to_insert.is_empty());
        assert!(second.to_delete.is_empty());
        assert_eq!(second.to_update, keys(&["b", "c"]));
    }

    /// In-memory model of the set-update primitive: the surviving rowset is
    /// exactly the desired set, regardless of the starting point.
    fn apply(existing: &[String], desired: &[String]) -> Vec<String> {
        let diff = diff_keys(existing, desired);
        let mut rows: Vec<String> = existing.to_vec();
        rows.retain(|k| !diff.to_delete.contains(k));
        rows.extend(diff.to_insert);
        rows.sort();
        rows
    }

    #[test]
    fn test_set_update_converges() {
        let s1 = keys(&["capacity", "things"]);
        let s2 = keys(&["capacity"]);

        // version bump with resource removal: after applying s2 on top of
        // s1's rowset, only the surviving resource remains
        let after_s1 = apply(&[], &s1);
        assert_eq!(after_s1, keys(&["capacity", "things"]));
        let after_s2 = apply(&after_s1, &s2);
        assert_eq!(after_s2, keys(&["capacity"]));

        // composition equals direct application
        assert_eq!(after_s2, apply(&[], &s2));
        // idempotence
        assert_eq!(apply(&after_s2, &s2), after_s2);
    }

    #[test]
    fn test_desired_azs_flat() {
        let real = vec![
            AvailabilityZone::new("az-one"),
            AvailabilityZone::new("az-two"),
        ];
        assert_eq!(desired_azs(Topology::Flat, &real), keys(&["any"]));
    }

    #[test]
    fn test_desired_azs_az_aware() {
        let real = vec![
            AvailabilityZone::new("az-one"),
            AvailabilityZone::new("az-two"),
        ];
        assert_eq!(
            desired_azs(Topology::AzAware, &real),
            keys(&["az-one", "az-two", "unknown"])
        );
    }

    #[test]
    fn test_service_info_key_extraction() {
        let mut resources = Map::new();
        resources.insert(
            "cores".into(),
            ResourceInfo {
                unit: Unit::None,
                topology: Topology::AzAware,
                has_capacity: true,
                needs_resource_demand: false,
                has_quota: true,
                attributes: None,
            },
        );
        let service_info = ServiceInfo {
            version: 1,
            resources,
            rates: Map::new(),
            usage_metric_families: None,
            capacity_metric_families: None,
            flags: ServiceInfoFlags::default(),
        };
        let desired: Vec<String> = service_info
            .resources
            .keys()
            .map(|n| n.as_str().to_string())
            .collect();
        assert_eq!(desired, keys(&["cores"]));
    }
}
