//! Commitment lifecycle engine.
//!
//! State machine: planned → pending once `confirm_by` is reached, pending →
//! active once the amount fits under the AZ resource's effective capacity,
//! active → expired on `expires_at`. Conversion between resources sharing a
//! conversion identifier supersedes the source and issues a successor at the
//! reduced integer ratio. The sum of active commitments on an AZ resource
//! never exceeds its effective capacity; confirmation runs under the
//! commitment row locks, one sweep at a time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared::types::{ResourceName, ServiceType, TimeSpan};
use sqlx::{FromRow, Row};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::mail::{self, CommitmentMailEvent, CommitmentMailInfo};
use crate::scheduler::{Job, JobKind};

#[derive(Error, Debug)]
pub enum CommitmentError {
    #[error("commitment not found")]
    NotFound,
    #[error("commitments are not convertible: {0}")]
    NotConvertible(String),
    #[error("conversion would exceed the target capacity")]
    CapacityExceeded,
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// The reduced exchange ratio between two conversion weights.
pub fn conversion_ratio(weight_source: u64, weight_target: u64) -> (u64, u64) {
    let g = gcd(weight_source, weight_target);
    (weight_source / g, weight_target / g)
}

/// Convert an amount between two resources with the given weights. Returns
/// `None` when the amount does not divide evenly under the reduced ratio;
/// conversions never leave a residual on the source.
pub fn convert_amount(amount: u64, weight_source: u64, weight_target: u64) -> Option<u64> {
    let (p, q) = conversion_ratio(weight_source, weight_target);
    let scaled = amount.checked_mul(q)?;
    if scaled % p != 0 {
        return None;
    }
    Some(scaled / p)
}

/// Whether a commitment of `amount` fits under the capacity ceiling next to
/// the already-active commitments.
pub fn fits_capacity(amount: u64, active_sum: u64, effective_capacity: u64) -> bool {
    active_sum.saturating_add(amount) <= effective_capacity
}

#[derive(Debug, FromRow)]
struct PendingCommitment {
    id: i64,
    uuid: Uuid,
    az_resource_id: i64,
    project_id: i64,
    amount: i64,
    duration: String,
    service_type: String,
    resource_name: String,
    az: String,
    raw_capacity: i64,
}

/// Confirmation sweep: promotes planned commitments whose `confirm_by` has
/// arrived, then walks pending commitments oldest-first and activates every
/// one that fits.
pub struct CommitmentConfirmJob {
    cluster: Arc<Cluster>,
}

impl CommitmentConfirmJob {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        CommitmentConfirmJob { cluster }
    }
}

#[async_trait]
impl Job for CommitmentConfirmJob {
    fn kind(&self) -> JobKind {
        JobKind::CommitmentConfirm
    }

    async fn poll_once(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut tx = self.cluster.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE commitments SET state = 'pending'
            WHERE state = 'planned' AND confirm_by IS NOT NULL AND confirm_by <= $1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let pending: Vec<PendingCommitment> = sqlx::query_as(
            r#"
            SELECT c.id, c.uuid, c.az_resource_id, c.project_id, c.amount, c.duration,
                   cs.service_type, cr.name AS resource_name, car.az, car.raw_capacity
            FROM commitments c
            JOIN cluster_az_resources car ON car.id = c.az_resource_id
            JOIN cluster_resources cr ON cr.id = car.resource_id
            JOIN cluster_services cs ON cs.id = cr.service_id
            WHERE c.state = 'pending'
            ORDER BY c.created_at, c.uuid
            FOR UPDATE OF c SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut confirmed: Vec<(i64, CommitmentMailInfo)> = Vec::new();
        for commitment in &pending {
            let service_type = ServiceType::from(commitment.service_type.as_str());
            let resource = ResourceName::from(commitment.resource_name.as_str());

            let behavior = self
                .cluster
                .config
                .commitment_behavior_for(&service_type, &resource);
            if let Some(min_confirm) = behavior.and_then(|rule| rule.min_confirm_date) {
                if now < min_confirm {
                    continue;
                }
            }

            let factor = self
                .cluster
                .config
                .behavior_for(&service_type, &resource)
                .overcommit_factor;
            let effective_capacity = factor.apply_to(commitment.raw_capacity.max(0) as u64);

            let active_sum: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(amount), 0)::BIGINT FROM commitments
                WHERE az_resource_id = $1 AND state = 'active'
                "#,
            )
            .bind(commitment.az_resource_id)
            .fetch_one(&mut *tx)
            .await?;

            let amount = commitment.amount.max(0) as u64;
            if !fits_capacity(amount, active_sum.max(0) as u64, effective_capacity) {
                continue;
            }

            let duration: TimeSpan = match commitment.duration.parse() {
                Ok(duration) => duration,
                Err(e) => {
                    warn!(commitment = %commitment.uuid, error = e.as_str(), "unparseable duration");
                    continue;
                }
            };
            let expires_at = duration.add_to(now);
            sqlx::query(
                r#"
                UPDATE commitments
                SET state = 'active', confirmed_at = $2, expires_at = $3
                WHERE id = $1
                "#,
            )
            .bind(commitment.id)
            .bind(now)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

            info!(
                commitment = %commitment.uuid,
                service = commitment.service_type.as_str(),
                resource = commitment.resource_name.as_str(),
                az = commitment.az.as_str(),
                amount,
                "commitment confirmed"
            );
            confirmed.push((
                commitment.project_id,
                CommitmentMailInfo {
                    uuid: commitment.uuid,
                    service: commitment.service_type.clone(),
                    resource: commitment.resource_name.clone(),
                    az: commitment.az.clone(),
                    amount,
                    duration: commitment.duration.clone(),
                    expires_at: Some(expires_at),
                },
            ));
        }

        for (project_id, info) in &confirmed {
            mail::enqueue_commitment_mail(
                &mut tx,
                &self.cluster.config,
                *project_id,
                CommitmentMailEvent::Confirmed,
                std::slice::from_ref(info),
            )
            .await?;
        }
        tx.commit().await?;

        // a sweep covers everything due; pace by the idle interval
        Ok(false)
    }
}

/// Expiry sweep: active commitments whose `expires_at` has passed.
pub struct CommitmentExpireJob {
    cluster: Arc<Cluster>,
}

impl CommitmentExpireJob {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        CommitmentExpireJob { cluster }
    }
}

#[async_trait]
impl Job for CommitmentExpireJob {
    fn kind(&self) -> JobKind {
        JobKind::CommitmentExpire
    }

    async fn poll_once(&self) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut tx = self.cluster.pool.begin().await?;

        let expired = sqlx::query(
            r#"
            UPDATE commitments c
            SET state = 'expired'
            FROM cluster_az_resources car, cluster_resources cr, cluster_services cs
            WHERE car.id = c.az_resource_id AND cr.id = car.resource_id
              AND cs.id = cr.service_id
              AND c.state = 'active' AND c.expires_at IS NOT NULL AND c.expires_at <= $1
            RETURNING c.uuid, c.project_id, c.amount, c.duration, c.expires_at,
                      cs.service_type, cr.name AS resource_name, car.az
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for row in &expired {
            let project_id: i64 = row.try_get("project_id")?;
            let uuid: Uuid = row.try_get("uuid")?;
            let amount: i64 = row.try_get("amount")?;
            info!(commitment = %uuid, "commitment expired");
            mail::enqueue_commitment_mail(
                &mut tx,
                &self.cluster.config,
                project_id,
                CommitmentMailEvent::Expired,
                &[CommitmentMailInfo {
                    uuid,
                    service: row.try_get("service_type")?,
                    resource: row.try_get("resource_name")?,
                    az: row.try_get("az")?,
                    amount: amount.max(0) as u64,
                    duration: row.try_get("duration")?,
                    expires_at: row.try_get("expires_at")?,
                }],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(false)
    }
}

#[derive(Debug, FromRow)]
struct SourceCommitment {
    id: i64,
    state: String,
    amount: i64,
    duration: String,
    confirm_by: Option<chrono::DateTime<Utc>>,
    confirmed_at: Option<chrono::DateTime<Utc>>,
    expires_at: Option<chrono::DateTime<Utc>>,
    project_id: i64,
    service_type: String,
    resource_name: String,
    az: String,
}

/// Convert a commitment onto another resource. The source must be pending
/// or active; it becomes superseded and the returned successor carries the
/// converted amount, linked via `predecessor_id`.
pub async fn convert_commitment(
    cluster: &Cluster,
    commitment_uuid: Uuid,
    target_service: &ServiceType,
    target_resource: &ResourceName,
) -> Result<Uuid, CommitmentError> {
    let now = Utc::now();
    let mut tx = cluster.pool.begin().await?;

    let source: SourceCommitment = sqlx::query_as(
        r#"
        SELECT c.id, c.state::text AS state, c.amount, c.duration,
               c.confirm_by, c.confirmed_at, c.expires_at, c.project_id,
               cs.service_type, cr.name AS resource_name, car.az
        FROM commitments c
        JOIN cluster_az_resources car ON car.id = c.az_resource_id
        JOIN cluster_resources cr ON cr.id = car.resource_id
        JOIN cluster_services cs ON cs.id = cr.service_id
        WHERE c.uuid = $1 AND c.state IN ('pending', 'active')
        FOR UPDATE OF c
        "#,
    )
    .bind(commitment_uuid)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(CommitmentError::NotFound)?;

    let source_service = ServiceType::from(source.service_type.as_str());
    let source_resource = ResourceName::from(source.resource_name.as_str());

    let source_rule = cluster
        .config
        .commitment_behavior_for(&source_service, &source_resource)
        .and_then(|rule| rule.conversion_rule.as_ref())
        .ok_or_else(|| {
            CommitmentError::NotConvertible(format!(
                "{source_service}/{source_resource} has no conversion rule"
            ))
        })?;
    let target_rule = cluster
        .config
        .commitment_behavior_for(target_service, target_resource)
        .and_then(|rule| rule.conversion_rule.as_ref())
        .ok_or_else(|| {
            CommitmentError::NotConvertible(format!(
                "{target_service}/{target_resource} has no conversion rule"
            ))
        })?;
    if source_rule.identifier != target_rule.identifier {
        return Err(CommitmentError::NotConvertible(format!(
            "conversion identifiers differ ({} vs {})",
            source_rule.identifier, target_rule.identifier
        )));
    }

    let amount = source.amount.max(0) as u64;
    let converted =
        convert_amount(amount, source_rule.weight, target_rule.weight).ok_or_else(|| {
            CommitmentError::NotConvertible(format!(
                "amount {amount} does not divide evenly at ratio {:?}",
                conversion_ratio(source_rule.weight, target_rule.weight)
            ))
        })?;

    // the successor lives on the same AZ of the target resource
    let target_row = sqlx::query(
        r#"
        SELECT car.id, car.raw_capacity
        FROM cluster_az_resources car
        JOIN cluster_resources cr ON cr.id = car.resource_id
        JOIN cluster_services cs ON cs.id = cr.service_id
        WHERE cs.service_type = $1 AND cr.name = $2 AND car.az = $3
        FOR UPDATE
        "#,
    )
    .bind(target_service.as_str())
    .bind(target_resource.as_str())
    .bind(&source.az)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| {
        CommitmentError::NotConvertible(format!(
            "{target_service}/{target_resource} has no AZ {:?}",
            source.az
        ))
    })?;
    let target_az_resource_id: i64 = target_row.try_get("id")?;
    let target_raw_capacity: i64 = target_row.try_get("raw_capacity")?;

    if source.state == "active" {
        let factor = cluster
            .config
            .behavior_for(target_service, target_resource)
            .overcommit_factor;
        let effective_capacity = factor.apply_to(target_raw_capacity.max(0) as u64);
        let active_sum: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT FROM commitments
            WHERE az_resource_id = $1 AND state = 'active'
            "#,
        )
        .bind(target_az_resource_id)
        .fetch_one(&mut *tx)
        .await?;
        if !fits_capacity(converted, active_sum.max(0) as u64, effective_capacity) {
            return Err(CommitmentError::CapacityExceeded);
        }
    }

    let successor_uuid = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO commitments
            (uuid, az_resource_id, project_id, amount, duration, created_at,
             confirm_by, confirmed_at, expires_at, predecessor_id, state)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11::commitment_state)
        "#,
    )
    .bind(successor_uuid)
    .bind(target_az_resource_id)
    .bind(source.project_id)
    .bind(converted as i64)
    .bind(&source.duration)
    .bind(now)
    .bind(source.confirm_by)
    .bind(source.confirmed_at)
    .bind(source.expires_at)
    .bind(source.id)
    .bind(&source.state)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE commitments SET state = 'superseded', superseded_at = $2 WHERE id = $1
        "#,
    )
    .bind(source.id)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(
        source = %commitment_uuid,
        successor = %successor_uuid,
        amount_before = amount,
        amount_after = converted,
        "commitment converted"
    );
    Ok(successor_uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(32, 48), 16);
        assert_eq!(gcd(48, 32), 16);
        assert_eq!(gcd(7, 13), 1);
        assert_eq!(gcd(0, 5), 5);
    }

    #[test]
    fn test_conversion_ratio_reduced() {
        assert_eq!(conversion_ratio(32, 48), (2, 3));
        assert_eq!(conversion_ratio(48, 32), (3, 2));
        assert_eq!(conversion_ratio(5, 5), (1, 1));
    }

    #[test]
    fn test_convert_amount_matches_reference_arithmetic() {
        // weights 32:48 reduce to 2:3, so 6 source units become 9
        assert_eq!(convert_amount(6, 32, 48), Some(9));
        // and the reverse conversion recovers the original amount
        assert_eq!(convert_amount(9, 48, 32), Some(6));
    }

    #[test]
    fn test_convert_amount_refuses_remainders() {
        // 5 * 3 = 15 does not divide by 2
        assert_eq!(convert_amount(5, 32, 48), None);
        assert_eq!(convert_amount(0, 32, 48), Some(0));
    }

    #[test]
    fn test_conversion_round_trip_when_divisible() {
        for amount in [2u64, 4, 6, 8, 100] {
            let there = convert_amount(amount, 32, 48).unwrap();
            let back = convert_amount(there, 48, 32).unwrap();
            assert_eq!(back, amount);
        }
    }

    #[test]
    fn test_fits_capacity_ceiling() {
        // effective capacity 100, 80 already active
        assert!(fits_capacity(20, 80, 100));
        assert!(!fits_capacity(25, 80, 100));
        assert!(fits_capacity(0, 100, 100));
        assert!(!fits_capacity(1, 100, 100));
    }

    #[test]
    fn test_fits_capacity_no_overflow() {
        assert!(!fits_capacity(u64::MAX, u64::MAX, u64::MAX));
    }
}
