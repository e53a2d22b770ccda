//! Store row types. Field names match the column names in `doc/schema.sql`;
//! migrations are managed outside this repository.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::types::TimeSpan;

/// Resource topology: whether capacity and usage are sharded by AZ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "topology_type")]
pub enum Topology {
    #[serde(rename = "flat")]
    #[sqlx(rename = "flat")]
    Flat,
    #[serde(rename = "az-aware")]
    #[sqlx(rename = "az-aware")]
    AzAware,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Flat => write!(f, "flat"),
            Topology::AzAware => write!(f, "az-aware"),
        }
    }
}

/// One backend service as known to the catalog. The `liquid_version` ties
/// the whole sub-tree of resources, AZ rows and rates together: all
/// children carry the version of the `ServiceInfo` they were created from.
#[derive(Debug, Clone, FromRow)]
pub struct ClusterService {
    pub id: i64,
    pub service_type: String,
    pub liquid_version: i64,
    pub next_scrape_at: DateTime<Utc>,
    pub next_capacity_scrape_at: DateTime<Utc>,
    pub capacity_scrape_error_count: i32,
    pub usage_metric_families_json: Option<serde_json::Value>,
    pub capacity_metric_families_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ClusterResource {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub liquid_version: i64,
    pub unit: String,
    pub topology: Topology,
    pub has_capacity: bool,
    pub needs_resource_demand: bool,
    pub has_quota: bool,
    pub attributes_json: Option<serde_json::Value>,
}

/// AZ-sharded capacity/usage row under a `ClusterResource`. Flat resources
/// have exactly one row with AZ `any`; AZ-aware resources have one row per
/// real AZ plus the pseudo-AZ rows.
#[derive(Debug, Clone, FromRow)]
pub struct ClusterAZResource {
    pub id: i64,
    pub resource_id: i64,
    pub az: String,
    pub raw_capacity: i64,
    pub usage: i64,
    pub last_nonzero_raw_capacity: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ClusterRate {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub liquid_version: i64,
    pub unit: String,
    pub has_usage: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Project {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub parent_uuid: Option<Uuid>,
    pub domain_uuid: Uuid,
    pub domain_name: String,
}

/// Scheduler state for one (project, service) pair. The `next_*_at` columns
/// drive job claims; the error counts feed the retry backoff.
#[derive(Debug, Clone, FromRow)]
pub struct ProjectService {
    pub id: i64,
    pub project_id: i64,
    pub service_type: String,
    pub next_scrape_at: DateTime<Utc>,
    pub next_rate_scrape_at: DateTime<Utc>,
    pub scrape_error_count: i32,
    pub rate_scrape_error_count: i32,
    pub quota_desynced_at: Option<DateTime<Utc>>,
    pub quota_sync_error_count: i32,
    pub serialized_rate_state: Option<String>,
}

/// Quota for one resource in one project. `quota` is what the distributor
/// granted; `backend_quota` is what the adapter last acknowledged. A
/// negative quota means infinite.
#[derive(Debug, Clone, FromRow)]
pub struct ProjectResource {
    pub id: i64,
    pub project_service_id: i64,
    pub name: String,
    pub quota: Option<i64>,
    pub backend_quota: Option<i64>,
    pub min_quota: Option<i64>,
    pub max_quota: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProjectAZResource {
    pub id: i64,
    pub project_resource_id: i64,
    pub az: String,
    pub usage: i64,
    pub physical_usage: Option<i64>,
    pub historical_usage_json: Option<String>,
}

/// Rate usage observed for one project. Counters are monotonically
/// increasing and may exceed 2^63, hence NUMERIC in the store.
#[derive(Debug, Clone, FromRow)]
pub struct ProjectRate {
    pub id: i64,
    pub project_service_id: i64,
    pub name: String,
    pub usage_as_bigint: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "commitment_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommitmentState {
    Planned,
    Pending,
    Active,
    Superseded,
    Expired,
}

impl std::fmt::Display for CommitmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitmentState::Planned => "planned",
            CommitmentState::Pending => "pending",
            CommitmentState::Active => "active",
            CommitmentState::Superseded => "superseded",
            CommitmentState::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// A tenant's time-bounded reservation of capacity on one AZ resource.
/// Terminal states (`superseded`, `expired`) are retained for auditing.
#[derive(Debug, Clone, FromRow)]
pub struct Commitment {
    pub id: i64,
    pub uuid: Uuid,
    pub az_resource_id: i64,
    pub project_id: i64,
    pub amount: i64,
    pub duration: String,
    pub created_at: DateTime<Utc>,
    pub confirm_by: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub predecessor_id: Option<i64>,
    pub state: CommitmentState,
}

#[derive(Debug, Clone, FromRow)]
pub struct MailNotification {
    pub id: i64,
    pub project_id: i64,
    pub subject: String,
    pub body: String,
    pub next_submission_at: DateTime<Utc>,
    pub failed_submissions: i32,
}

/// Retained usage samples for one project AZ resource, serialized as JSON
/// in `project_az_resources.historical_usage_json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageHistory {
    pub samples: Vec<UsageSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSample {
    pub at: DateTime<Utc>,
    pub value: u64,
}

impl UsageHistory {
    pub fn from_json(buf: Option<&str>) -> Self {
        buf.and_then(|b| serde_json::from_str(b).ok())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"samples\":[]}".to_string())
    }

    /// Record a new sample and prune everything that has fallen out of the
    /// retention window.
    pub fn record(&mut self, at: DateTime<Utc>, value: u64, retention: &TimeSpan) {
        let cutoff = retention.subtract_from(at);
        self.samples.retain(|s| s.at >= cutoff);
        self.samples.push(UsageSample { at, value });
    }

    /// Maximum usage observed within the retention window ending at `now`.
    pub fn max_within(&self, retention: &TimeSpan, now: DateTime<Utc>) -> u64 {
        let cutoff = retention.subtract_from(now);
        self.samples
            .iter()
            .filter(|s| s.at >= cutoff)
            .map(|s| s.value)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_usage_history_record_prunes_old_samples() {
        let retention: TimeSpan = "7 days".parse().unwrap();
        let mut history = UsageHistory::default();
        history.record(at(1), 100, &retention);
        history.record(at(5), 50, &retention);
        history.record(at(20), 30, &retention);
        // both older samples are outside the 7-day window at day 20
        assert_eq!(history.samples.len(), 1);
        assert_eq!(history.max_within(&retention, at(20)), 30);
    }

    #[test]
    fn test_usage_history_max_within_window() {
        let retention: TimeSpan = "30 days".parse().unwrap();
        let mut history = UsageHistory::default();
        history.record(at(1), 80, &retention);
        history.record(at(10), 40, &retention);
        assert_eq!(history.max_within(&retention, at(10)), 80);

        let narrow: TimeSpan = "2 days".parse().unwrap();
        assert_eq!(history.max_within(&narrow, at(10)), 40);
    }

    #[test]
    fn test_usage_history_json_round_trip() {
        let retention: TimeSpan = "30 days".parse().unwrap();
        let mut history = UsageHistory::default();
        history.record(at(3), 12, &retention);
        let restored = UsageHistory::from_json(Some(&history.to_json()));
        assert_eq!(restored, history);
    }

    #[test]
    fn test_usage_history_tolerates_missing_json() {
        assert_eq!(UsageHistory::from_json(None), UsageHistory::default());
        assert_eq!(
            UsageHistory::from_json(Some("not json")),
            UsageHistory::default()
        );
    }

    #[test]
    fn test_commitment_state_display() {
        assert_eq!(CommitmentState::Pending.to_string(), "pending");
        assert_eq!(CommitmentState::Superseded.to_string(), "superseded");
    }
}
