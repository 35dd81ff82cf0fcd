//! Tracing and telemetry instrumentation for corral.
//!
//! Helpers for creating tracing spans and recording job and worker lifecycle
//! events. Every recorder logs through `tracing` and, when the `metrics`
//! feature is enabled, forwards to the Prometheus collectors in
//! [`crate::metrics`]. Without the feature they only log.
//!
//! # Example
//!
//! ```ignore
//! use corral::telemetry::{job_execute_span, record_job_start, record_job_end};
//!
//! let timing = record_job_start(job_id.to_string());
//! let output = handler.handle(ctx, payload).instrument(job_execute_span(&job_id, "echo", 1)).await;
//! record_job_end(timing, "default", "echo", "finished");
//! ```

use std::time::Duration;

use tracing::{info_span, Span};

/// Span for a single enqueue.
#[must_use]
pub fn job_enqueue_span(task_name: impl AsRef<str>, queue_name: impl AsRef<str>) -> Span {
    info_span!(
        "corral.enqueue",
        task = %task_name.as_ref(),
        queue = %queue_name.as_ref(),
    )
}

/// Span covering a worker's wait for its next job.
#[must_use]
pub fn job_dequeue_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("corral.dequeue", worker_id = %worker_id.as_ref())
}

/// Span wrapping one handler invocation.
///
/// # Arguments
/// * `job_id` - The job being executed
/// * `task_name` - Registered task name
/// * `attempt` - 1 on the first run, incremented per retry
#[must_use]
pub fn job_execute_span(job_id: impl ToString, task_name: impl AsRef<str>, attempt: u32) -> Span {
    info_span!(
        "corral.execute",
        job_id = %job_id.to_string(),
        task = %task_name.as_ref(),
        attempt = attempt,
    )
}

#[must_use]
pub fn reap_span() -> Span {
    info_span!("corral.reap")
}

#[must_use]
pub fn heartbeat_span(node_id: impl AsRef<str>) -> Span {
    info_span!("corral.heartbeat", node_id = %node_id.as_ref())
}

pub fn record_job_enqueued(queue_name: &str, task_name: &str) {
    tracing::debug!(queue = queue_name, task = task_name, "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(queue_name, task_name);
}

pub fn record_job_started(queue_name: &str, task_name: &str) {
    tracing::debug!(queue = queue_name, task = task_name, "job started");
}

/// Record a job reaching a terminal status.
///
/// # Arguments
/// * `status` - One of `finished`, `failed`, `cancelled`
pub fn record_job_finished(queue_name: &str, task_name: &str, status: &str) {
    tracing::debug!(queue = queue_name, task = task_name, status, "job reached terminal status");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(queue_name, task_name, status);
}

pub fn record_job_retrying(queue_name: &str, task_name: &str, retries_used: u32, delay: Duration) {
    tracing::info!(
        queue = queue_name,
        task = task_name,
        retries_used,
        delay_ms = delay.as_millis() as u64,
        "job scheduled for retry"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_retried(queue_name, task_name);
}

/// Record a lost attempt put back on its queue outside the retry budget.
pub fn record_job_requeued(queue_name: &str, task_name: &str, recoveries: u32, delay: Duration) {
    tracing::info!(
        queue = queue_name,
        task = task_name,
        recoveries,
        delay_ms = delay.as_millis() as u64,
        "lost attempt requeued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_retried(queue_name, task_name);
}

/// Record a started job swept by the reaper after its timeout.
pub fn record_job_reaped(queue_name: &str, task_name: &str) {
    tracing::warn!(queue = queue_name, task = task_name, "job exceeded its timeout and was reaped");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_reaped(queue_name, task_name);
}

/// Record a worker leaving the pool.
///
/// # Arguments
/// * `reason` - One of `stopped`, `recycled`, `crashed`, `timed_out`, `killed`
pub fn record_worker_exit(worker_id: &str, reason: &str) {
    tracing::debug!(worker_id, reason, "worker exited");

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_exit(reason);
}

/// Record a store operation that failed because the backend was unreachable.
pub fn record_store_unavailable(operation: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(operation, error = %error, "job store unavailable");

    #[cfg(feature = "metrics")]
    crate::metrics::record_store_unavailable(operation);
}

pub fn set_queue_depth(queue_name: &str, state: &str, depth: usize) {
    tracing::trace!(queue = queue_name, state, depth, "queue depth sampled");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(queue_name, state, depth as f64);
}

/// Update the per-state worker gauge.
pub fn set_worker_count(state: &str, count: usize) {
    tracing::trace!(state, count, "worker count sampled");

    #[cfg(feature = "metrics")]
    crate::metrics::set_worker_count(state, count as f64);
}

pub fn observe_job_duration(queue_name: &str, task_name: &str, status: &str, duration_secs: f64) {
    tracing::debug!(
        queue = queue_name,
        task = task_name,
        status,
        duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(queue_name, task_name, status, duration_secs);
}

/// Record the start of job execution for duration tracking.
///
/// Returns an opaque handle that should be passed to [`record_job_end`].
pub fn record_job_start(job_id: impl Into<String>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.into(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of job execution and update duration metrics.
pub fn record_job_end(handle: JobTimingHandle, queue_name: &str, task_name: &str, status: &str) {
    observe_job_duration(queue_name, task_name, status, handle.elapsed().as_secs_f64());
}

/// Handle for tracking job execution duration.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_spans_are_named() {
        let subscriber = tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).finish();
        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(job_enqueue_span("echo", "default").metadata().unwrap().name(), "corral.enqueue");
            assert_eq!(job_dequeue_span("w0").metadata().unwrap().name(), "corral.dequeue");
            assert_eq!(
                job_execute_span("job-123", "echo", 1).metadata().unwrap().name(),
                "corral.execute"
            );
        });
    }

    #[test]
    fn test_maintenance_spans_are_named() {
        let subscriber = tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).finish();
        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(reap_span().metadata().unwrap().name(), "corral.reap");
            assert_eq!(heartbeat_span("node-a").metadata().unwrap().name(), "corral.heartbeat");
        });
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_job_start("job-123");
        assert_eq!(handle.job_id(), "job-123");

        std::thread::sleep(Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        // record_job_end should not panic
        record_job_end(handle, "default", "echo", "finished");
    }

    #[test]
    fn test_recorders_do_not_panic() {
        record_job_enqueued("default", "echo");
        record_job_retrying("default", "echo", 1, Duration::from_millis(10));
        record_job_reaped("default", "echo");
        record_worker_exit("w0", "recycled");
        record_store_unavailable("dequeue", &"connection refused");
        set_queue_depth("default", "pending", 3);
        set_worker_count("idle", 2);
    }
}
