//! Cooperative job engine.
//!
//! Jobs claim their work with `SELECT ... FOR UPDATE SKIP LOCKED` on the
//! due-time column of their table, so at most one worker in the whole fleet
//! executes a given (project, service, jobtype) at any instant; the row lock
//! is the only mutual exclusion. The loop here only handles pacing, retry
//! accounting, deadlines and shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    CapacityScrape,
    UsageScrape,
    RateScrape,
    QuotaApply,
    CommitmentConfirm,
    CommitmentExpire,
    MailDelivery,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::CapacityScrape => "capacity_scrape",
            JobKind::UsageScrape => "usage_scrape",
            JobKind::RateScrape => "rate_scrape",
            JobKind::QuotaApply => "quota_apply",
            JobKind::CommitmentConfirm => "commitment_confirm",
            JobKind::CommitmentExpire => "commitment_expire",
            JobKind::MailDelivery => "mail_delivery",
        }
    }
}

/// One scheduler job type. `poll_once` claims and processes at most one unit
/// of work; returning `Ok(false)` means nothing was due and the worker may
/// sleep.
#[async_trait]
pub trait Job: Send + Sync {
    fn kind(&self) -> JobKind;
    async fn poll_once(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Sleep between polls when no work is due.
    pub idle_interval: Duration,
    /// Hard deadline for a single unit of work; on expiry the transaction is
    /// dropped and rolled back.
    pub deadline: Duration,
    /// Number of workers for this job kind.
    pub workers: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        JobSettings {
            idle_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(300),
            workers: 1,
        }
    }
}

/// Spawn the configured number of workers for one job onto `tasks`.
pub fn spawn_workers(
    tasks: &mut tokio::task::JoinSet<()>,
    job: Arc<dyn Job>,
    settings: JobSettings,
    shutdown: watch::Receiver<bool>,
) {
    for worker in 0..settings.workers.max(1) {
        let job = Arc::clone(&job);
        let settings = settings.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            run_worker(job, settings, shutdown, worker).await;
        });
    }
}

async fn run_worker(
    job: Arc<dyn Job>,
    settings: JobSettings,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
) {
    let kind = job.kind().as_str();
    info!(job = kind, worker, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let worked = tokio::select! {
            _ = shutdown.changed() => break,
            result = run_one(job.as_ref(), settings.deadline) => result,
        };

        if !worked {
            // nothing due: sleep, but wake up promptly on shutdown
            let sleep = jittered(settings.idle_interval);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    info!(job = kind, worker, "worker stopped");
}

async fn run_one(job: &dyn Job, deadline: Duration) -> bool {
    let kind = job.kind().as_str();
    metrics::JOBS_IN_FLIGHT.with_label_values(&[kind]).inc();
    let started = std::time::Instant::now();

    let worked = match tokio::time::timeout(deadline, job.poll_once()).await {
        Ok(Ok(worked)) => {
            if worked {
                metrics::JOB_RUNS_TOTAL
                    .with_label_values(&[kind, "success"])
                    .inc();
            }
            worked
        }
        Ok(Err(e)) => {
            if is_store_fatal(&e) {
                // constraint violation or corruption: no retry can help, and
                // continuing would repeat the broken write forever
                error!(job = kind, error = %e, "fatal store error, terminating");
                std::process::exit(2);
            }
            // job-level failures are accounted on the claimed row by the job
            // itself; this catches claim/commit errors
            error!(job = kind, error = %e, "job poll failed");
            metrics::JOB_RUNS_TOTAL
                .with_label_values(&[kind, "error"])
                .inc();
            false
        }
        Err(_) => {
            warn!(job = kind, deadline_secs = deadline.as_secs(), "job deadline exceeded");
            metrics::JOB_RUNS_TOTAL
                .with_label_values(&[kind, "timeout"])
                .inc();
            false
        }
    };

    metrics::JOB_DURATION
        .with_label_values(&[kind])
        .observe(started.elapsed().as_secs_f64());
    metrics::JOBS_IN_FLIGHT.with_label_values(&[kind]).dec();
    debug!(job = kind, worked, "poll finished");
    worked
}

/// Integrity violations (SQLSTATE class 23) mean the store contradicts the
/// schema contract; retrying cannot fix that.
fn is_store_fatal(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::Database(db))
                if db.code().map_or(false, |code| code.starts_with("23"))
        )
    })
}

/// Exponential retry backoff: `base * 2^(error_count - 1)`, capped.
pub fn backoff_interval(base: Duration, max: Duration, error_count: i32) -> Duration {
    if error_count <= 0 {
        return base;
    }
    let exp = (error_count - 1).min(31) as u32;
    let secs = base
        .as_secs()
        .saturating_mul(2_u64.saturating_pow(exp))
        .min(max.as_secs());
    Duration::from_secs(secs)
}

/// Apply ±10% jitter so fleets of rows do not come due in lockstep.
pub fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

/// Next due time after a successful run.
pub fn next_due(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(jittered(interval)).unwrap_or(chrono::Duration::zero())
}

/// Next due time after a failure, by retry count.
pub fn retry_due(
    now: DateTime<Utc>,
    base: Duration,
    max: Duration,
    error_count: i32,
) -> DateTime<Utc> {
    now + chrono::Duration::from_std(backoff_interval(base, max, error_count))
        .unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotone_and_capped() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        let mut previous = Duration::ZERO;
        for error_count in 1..20 {
            let interval = backoff_interval(base, max, error_count);
            assert!(interval >= previous, "backoff must not decrease");
            assert!(interval <= max, "backoff must stay under the cap");
            previous = interval;
        }
        assert_eq!(backoff_interval(base, max, 19), max);
    }

    #[test]
    fn test_backoff_sequence() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(120);
        assert_eq!(backoff_interval(base, max, 1).as_secs(), 1);
        assert_eq!(backoff_interval(base, max, 2).as_secs(), 2);
        assert_eq!(backoff_interval(base, max, 3).as_secs(), 4);
        assert_eq!(backoff_interval(base, max, 4).as_secs(), 8);
    }

    #[test]
    fn test_backoff_handles_huge_error_counts() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        assert_eq!(backoff_interval(base, max, i32::MAX), max);
    }

    #[test]
    fn test_jitter_bounds() {
        let interval = Duration::from_secs(100);
        for _ in 0..100 {
            let jittered = jittered(interval);
            assert!(jittered >= Duration::from_secs(90));
            assert!(jittered <= Duration::from_secs(111));
        }
    }

    #[test]
    fn test_plain_store_errors_are_not_fatal() {
        let error = anyhow::Error::from(sqlx::Error::RowNotFound);
        assert!(!is_store_fatal(&error));
        let error = anyhow::anyhow!("adapter unreachable");
        assert!(!is_store_fatal(&error));
    }

    #[test]
    fn test_retry_due_is_strictly_increasing_in_time() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        let now = Utc::now();
        let mut due_times = Vec::new();
        let mut t = now;
        for error_count in 1..10 {
            let due = retry_due(t, base, max, error_count);
            assert!(due > t);
            due_times.push(due);
            t = due;
        }
        for pair in due_times.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }
}
