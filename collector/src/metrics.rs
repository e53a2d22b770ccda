use once_cell::sync::Lazy;
use prometheus::{
    opts, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec,
};

macro_rules! counter_vec {
    ($name:expr, $help:expr, $labels:expr) => {
        Lazy::new(|| IntCounterVec::new(opts!($name, $help), $labels).unwrap())
    };
}
macro_rules! gauge_vec {
    ($name:expr, $help:expr, $labels:expr) => {
        Lazy::new(|| IntGaugeVec::new(opts!($name, $help), $labels).unwrap())
    };
}
macro_rules! histogram_vec {
    ($name:expr, $help:expr, $labels:expr) => {
        Lazy::new(|| {
            HistogramVec::new(
                HistogramOpts::new($name, $help).buckets(DURATION_BUCKETS.to_vec()),
                $labels,
            )
            .unwrap()
        })
    };
}

const DURATION_BUCKETS: [f64; 12] = [
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

// ── Scheduler ───────────────────────────────────────────────────────────────
pub static JOB_RUNS_TOTAL: Lazy<IntCounterVec> = counter_vec!(
    "granary_job_runs_total",
    "Job executions by kind and outcome",
    &["job", "outcome"]
);
pub static JOB_DURATION: Lazy<HistogramVec> = histogram_vec!(
    "granary_job_duration_seconds",
    "Job execution duration by kind",
    &["job"]
);
pub static JOBS_IN_FLIGHT: Lazy<IntGaugeVec> =
    gauge_vec!("granary_jobs_in_flight", "In-flight jobs by kind", &["job"]);

// ── Adapters ────────────────────────────────────────────────────────────────
pub static SCRAPE_FAILURES: Lazy<IntCounterVec> = counter_vec!(
    "granary_scrape_failures_total",
    "Failed scrapes by service and failure class",
    &["service", "class"]
);
pub static PROTOCOL_MISMATCHES: Lazy<IntCounterVec> = counter_vec!(
    "granary_liquid_protocol_mismatches_total",
    "Protocol mismatches (unknown fields, missing entries, version churn) by service",
    &["service"]
);
pub static QUOTA_REJECTIONS: Lazy<IntCounterVec> = counter_vec!(
    "granary_quota_rejections_total",
    "Quota updates rejected by the adapter, by service",
    &["service"]
);

// ── Mail ────────────────────────────────────────────────────────────────────
pub static MAIL_SUBMISSIONS: Lazy<IntCounterVec> = counter_vec!(
    "granary_mail_submissions_total",
    "Mail submissions by outcome",
    &["outcome"]
);

/// Register every metric with the default registry. Called once at startup;
/// double registration is a programming error and panics.
pub fn register_all() {
    let registry = prometheus::default_registry();
    registry.register(Box::new(JOB_RUNS_TOTAL.clone())).unwrap();
    registry.register(Box::new(JOB_DURATION.clone())).unwrap();
    registry.register(Box::new(JOBS_IN_FLIGHT.clone())).unwrap();
    registry.register(Box::new(SCRAPE_FAILURES.clone())).unwrap();
    registry
        .register(Box::new(PROTOCOL_MISMATCHES.clone()))
        .unwrap();
    registry
        .register(Box::new(QUOTA_REJECTIONS.clone()))
        .unwrap();
    registry
        .register(Box::new(MAIL_SUBMISSIONS.clone()))
        .unwrap();
}
