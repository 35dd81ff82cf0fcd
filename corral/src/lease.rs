use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{after_secs, Job, JobId};

/// Unique identifier for one execution attempt of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dequeued job together with the lease that authorises reporting its
/// outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    /// Unique identifier for this lease.
    pub lease_id: LeaseId,
    /// Snapshot of the job as it was marked `started`.
    pub job: Job,
    /// ID of the worker holding this lease.
    pub worker_id: String,
    /// When the job was handed out.
    pub leased_at: DateTime<Utc>,
}

impl JobLease {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// Reap deadline derived from the job's `timeout_seconds`.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.job
            .timeout_seconds
            .map(|secs| after_secs(self.leased_at, secs))
    }
}

/// Retry backoff configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_backoff_ms: 300000, // 5 minutes
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_backoff_ms,
        }
    }

    /// Delay before the next attempt of a job that has already used
    /// `retries_used` retries.
    ///
    /// Formula: delay = min(base_delay * 2^retries_used, max_backoff)
    pub fn delay_for(&self, retries_used: u32) -> Duration {
        let exp = retries_used.min(62) as i32;
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Result of reporting a failed attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailOutcome {
    /// Job re-entered the queue and becomes visible after `delay`.
    Retrying { retries_used: u32, delay: Duration },
    /// The attempt was lost (worker gone or reaped) and the job was put
    /// back after `delay` without using a retry.
    Requeued { recoveries: u32, delay: Duration },
    /// Job reached terminal `failed`.
    Failed,
    /// The job was not held by this attempt any more (reaped, cancelled,
    /// or already finished); nothing was written.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_id_display() {
        let id = LeaseId::new();
        let s = id.to_string();
        assert!(!s.is_empty());
    }

    #[test]
    fn test_delay_exponential() {
        let policy = RetryPolicy::default();

        // First retry -> base_delay * 2^0
        assert_eq!(policy.delay_for(0), Duration::from_millis(policy.base_delay_ms));
        assert_eq!(policy.delay_for(1), Duration::from_millis(policy.base_delay_ms * 2));
        assert_eq!(policy.delay_for(2), Duration::from_millis(policy.base_delay_ms * 4));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy::new(1000, 5000);
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
        // Huge exponents must not overflow.
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_delay_non_decreasing() {
        let policy = RetryPolicy::new(7, 1_000);
        let delays: Vec<_> = (0..20).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_lease_deadline_follows_timeout() {
        let options = crate::job::EnqueueOptions::default().with_timeout(5);
        let job = Job::new("echo", serde_json::Value::Null, &options);
        let lease = JobLease {
            lease_id: LeaseId::new(),
            job,
            worker_id: "w".into(),
            leased_at: Utc::now(),
        };
        let deadline = lease.deadline().unwrap();
        assert_eq!((deadline - lease.leased_at).num_seconds(), 5);

        let mut untimed = lease.clone();
        untimed.job.timeout_seconds = None;
        assert!(untimed.deadline().is_none());

        let mut unbounded = lease.clone();
        unbounded.job.timeout_seconds = Some(u64::MAX);
        assert!(unbounded.deadline().unwrap() > lease.leased_at);
    }
}
