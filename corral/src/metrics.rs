//! Prometheus metrics instrumentation for corral.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `corral_jobs_enqueued_total` - Jobs enqueued
//! - `corral_jobs_finished_total` - Jobs reaching a terminal status
//! - `corral_jobs_retried_total` - Failed attempts scheduled for retry
//! - `corral_jobs_reaped_total` - Started jobs swept after their timeout
//! - `corral_worker_exits_total` - Workers leaving the pool, by reason
//! - `corral_store_unavailable_total` - Store calls that hit an unreachable backend
//!
//! ## Gauges
//! - `corral_queue_depth` - Jobs per queue and state
//! - `corral_workers` - Workers per lifecycle state
//!
//! ## Histograms
//! - `corral_job_duration_seconds` - Handler execution time
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for corral metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("corral_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["queue", "task"])
        .expect("corral_jobs_enqueued_total metric creation failed")
});

/// Labels:
/// - `status`: finished, failed or cancelled
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "corral_jobs_finished_total",
        "Total number of jobs reaching a terminal status",
    );
    CounterVec::new(opts, &["queue", "task", "status"])
        .expect("corral_jobs_finished_total metric creation failed")
});

pub static JOBS_RETRIED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("corral_jobs_retried_total", "Total number of job retries scheduled");
    CounterVec::new(opts, &["queue", "task"])
        .expect("corral_jobs_retried_total metric creation failed")
});

pub static JOBS_REAPED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "corral_jobs_reaped_total",
        "Total number of started jobs swept after their timeout",
    );
    CounterVec::new(opts, &["queue", "task"])
        .expect("corral_jobs_reaped_total metric creation failed")
});

/// Labels:
/// - `reason`: stopped, recycled, crashed, timed_out or killed
pub static WORKER_EXITS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("corral_worker_exits_total", "Total number of worker exits");
    CounterVec::new(opts, &["reason"]).expect("corral_worker_exits_total metric creation failed")
});

pub static STORE_UNAVAILABLE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "corral_store_unavailable_total",
        "Total number of store operations failing on an unreachable backend",
    );
    CounterVec::new(opts, &["operation"])
        .expect("corral_store_unavailable_total metric creation failed")
});

/// Labels:
/// - `state`: pending, scheduled or started
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("corral_queue_depth", "Current depth of job queues");
    GaugeVec::new(opts, &["queue", "state"]).expect("corral_queue_depth metric creation failed")
});

pub static WORKERS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("corral_workers", "Current workers per lifecycle state");
    GaugeVec::new(opts, &["state"]).expect("corral_workers metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "corral_job_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "task", "status"])
        .expect("corral_job_duration_seconds metric creation failed")
});

/// Register every metric with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_RETRIED_TOTAL.clone()),
        Box::new(JOBS_REAPED_TOTAL.clone()),
        Box::new(WORKER_EXITS_TOTAL.clone()),
        Box::new(STORE_UNAVAILABLE_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(WORKERS.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(queue: &str, task: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[queue, task]).inc();
}

pub fn record_job_finished(queue: &str, task: &str, status: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[queue, task, status])
        .inc();
}

pub fn record_job_retried(queue: &str, task: &str) {
    JOBS_RETRIED_TOTAL.with_label_values(&[queue, task]).inc();
}

pub fn record_job_reaped(queue: &str, task: &str) {
    JOBS_REAPED_TOTAL.with_label_values(&[queue, task]).inc();
}

pub fn record_worker_exit(reason: &str) {
    WORKER_EXITS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_store_unavailable(operation: &str) {
    STORE_UNAVAILABLE_TOTAL.with_label_values(&[operation]).inc();
}

pub fn set_queue_depth(queue: &str, state: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue, state]).set(depth);
}

pub fn set_worker_count(state: &str, count: f64) {
    WORKERS.with_label_values(&[state]).set(count);
}

pub fn observe_job_duration(queue: &str, task: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[queue, task, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
