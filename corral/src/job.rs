use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use crate::lease::LeaseId;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_RESULT_TTL_SECS: u64 = 3600;
/// Upper bound for every duration accepted in [`EnqueueOptions`]: ten years.
pub const MAX_OPTION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal edges of the job lifecycle. `Started -> Queued` is the retry
    /// re-enqueue; every other edge moves strictly forward.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Started)
                | (Queued, Cancelled)
                | (Started, Finished)
                | (Started, Failed)
                | (Started, Queued)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error.
    Handler,
    /// No handler was registered when the job was dequeued.
    UnknownTask,
    /// The job outlived its `timeout_seconds` and was reaped.
    TimedOut,
    /// The worker holding the job crashed or was killed.
    WorkerLost,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::UnknownTask)
    }

    /// The attempt ended without the handler reporting back. Such jobs are
    /// requeued outside the retry budget.
    pub fn is_lost_attempt(&self) -> bool {
        matches!(self, FailureKind::TimedOut | FailureKind::WorkerLost)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Handler => "handler",
            FailureKind::UnknownTask => "unknown_task",
            FailureKind::TimedOut => "timed_out",
            FailureKind::WorkerLost => "worker_lost",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Handler, message)
    }

    pub fn unknown_task(task_name: &str) -> Self {
        Self::new(
            FailureKind::UnknownTask,
            format!("no handler registered for task `{task_name}`"),
        )
    }

    pub fn timed_out(timeout_seconds: u64) -> Self {
        Self::new(
            FailureKind::TimedOut,
            format!("job exceeded its {timeout_seconds}s timeout"),
        )
    }

    pub fn worker_lost(worker_id: &str) -> Self {
        Self::new(
            FailureKind::WorkerLost,
            format!("worker {worker_id} terminated while running the job"),
        )
    }
}

impl Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Per-call knobs for [`TaskQueue::enqueue`](crate::queue::TaskQueue::enqueue).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EnqueueOptions {
    pub max_retries: u32,
    /// `None` disables reaping for this job.
    pub timeout_seconds: Option<u64>,
    pub result_ttl_seconds: u64,
    pub queue_name: String,
    pub delay_seconds: u64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 0,
            timeout_seconds: None,
            result_ttl_seconds: DEFAULT_RESULT_TTL_SECS,
            queue_name: DEFAULT_QUEUE.to_string(),
            delay_seconds: 0,
        }
    }
}

impl EnqueueOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_result_ttl(mut self, seconds: u64) -> Self {
        self.result_ttl_seconds = seconds;
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay_seconds = seconds;
        self
    }

    /// Reject durations past [`MAX_OPTION_SECS`], naming the offending field.
    pub fn check_bounds(&self) -> Result<(), String> {
        let fields = [
            ("timeout_seconds", self.timeout_seconds.unwrap_or(0)),
            ("delay_seconds", self.delay_seconds),
            ("result_ttl_seconds", self.result_ttl_seconds),
        ];
        match fields.into_iter().find(|(_, secs)| *secs > MAX_OPTION_SECS) {
            Some((field, secs)) => Err(format!("{field}={secs} exceeds {MAX_OPTION_SECS}")),
            None => Ok(()),
        }
    }
}

/// `at + secs`, saturating at the latest representable time.
pub(crate) fn after_secs(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The persisted job record. Returned by value from status queries, so it
/// doubles as the read-only snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_name: String,
    pub queue_name: String,
    pub payload: Value,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Earliest time the job becomes visible to dequeue, when delayed.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub retries_used: u32,
    pub max_retries: u32,
    /// Requeues after a lost worker or a reap. Counted apart from
    /// `retries_used`.
    #[serde(default)]
    pub recoveries: u32,
    pub timeout_seconds: Option<u64>,
    pub result_ttl_seconds: u64,
    pub lease_id: Option<LeaseId>,
    pub worker_id: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(task_name: impl Into<String>, payload: Value, options: &EnqueueOptions) -> Self {
        Self {
            id: JobId::new(),
            task_name: task_name.into(),
            queue_name: options.queue_name.clone(),
            payload,
            status: JobStatus::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            scheduled_for: None,
            retries_used: 0,
            max_retries: options.max_retries,
            recoveries: 0,
            timeout_seconds: options.timeout_seconds,
            result_ttl_seconds: options.result_ttl_seconds,
            lease_id: None,
            worker_id: None,
            cancel_requested: false,
        }
    }

    /// Execution attempt number, starting at 1 for the first run.
    pub fn attempt(&self) -> u32 {
        self.retries_used + self.recoveries + 1
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retries_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_edges() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Started));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Started.can_transition_to(Finished));
        assert!(Started.can_transition_to(Failed));
        assert!(Started.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Finished));
        assert!(!Started.can_transition_to(Cancelled));
        for terminal in [Finished, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Queued, Started, Finished, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn enqueue_option_defaults() {
        let options = EnqueueOptions::default();
        assert_eq!(options.max_retries, 0);
        assert_eq!(options.timeout_seconds, None);
        assert_eq!(options.result_ttl_seconds, 3600);
        assert_eq!(options.queue_name, "default");
        assert_eq!(options.delay_seconds, 0);
    }

    #[test]
    fn record_serializes_status_in_snake_case() {
        let job = Job::new("echo", json!({"x": 1}), &EnqueueOptions::default());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["payload"]["x"], 1);

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn only_unknown_task_is_permanent() {
        assert!(!FailureKind::UnknownTask.is_retryable());
        assert!(FailureKind::Handler.is_retryable());
        assert!(FailureKind::TimedOut.is_retryable());
        assert!(FailureKind::WorkerLost.is_retryable());
        assert!(FailureKind::TimedOut.is_lost_attempt());
        assert!(FailureKind::WorkerLost.is_lost_attempt());
        assert!(!FailureKind::Handler.is_lost_attempt());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        assert!(EnqueueOptions::default().with_timeout(MAX_OPTION_SECS).check_bounds().is_ok());

        let err = EnqueueOptions::default().with_timeout(u64::MAX).check_bounds().unwrap_err();
        assert!(err.starts_with("timeout_seconds="));
        let err = EnqueueOptions::default().with_delay(100_000_000_000_000_000).check_bounds().unwrap_err();
        assert!(err.starts_with("delay_seconds="));
        assert!(EnqueueOptions::default().with_result_ttl(u64::MAX).check_bounds().is_err());
    }

    #[test]
    fn deadline_arithmetic_saturates() {
        let now = Utc::now();
        assert_eq!(after_secs(now, 2), now + chrono::TimeDelta::seconds(2));
        assert_eq!(after_secs(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(after_secs(now, 100_000_000_000_000_000), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn attempt_counts_retries_and_recoveries() {
        let mut job = Job::new("echo", json!(null), &EnqueueOptions::default());
        assert_eq!(job.attempt(), 1);
        job.retries_used = 1;
        job.recoveries = 2;
        assert_eq!(job.attempt(), 4);
    }

    #[test]
    fn job_id_parses_its_display_form() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
