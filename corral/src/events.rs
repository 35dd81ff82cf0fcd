use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{FailureKind, JobId};

/// Job lifecycle transition observed by the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub task_name: String,
    pub queue_name: String,
    pub timestamp: DateTime<Utc>,
    pub kind: JobEventKind,
}

impl JobEvent {
    pub fn new(
        job_id: JobId,
        task_name: impl Into<String>,
        queue_name: impl Into<String>,
        kind: JobEventKind,
    ) -> Self {
        Self {
            job_id,
            task_name: task_name.into(),
            queue_name: queue_name.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventKind {
    /// Job was written and is pending or scheduled.
    Enqueued { delayed: bool },
    /// Job was handed to a worker.
    Started { worker_id: String, attempt: u32 },
    /// Handler succeeded.
    Finished,
    /// Attempt failed and the job will run again after `delay_ms`.
    Retrying {
        failure: FailureKind,
        retries_used: u32,
        delay_ms: u64,
    },
    /// Attempt was lost to a dead worker or a reap and the job was put back
    /// without using a retry.
    Requeued {
        failure: FailureKind,
        recoveries: u32,
        delay_ms: u64,
    },
    /// Attempt failed with no retries left, or permanently.
    Failed { failure: FailureKind },
    /// Cancelled while still queued.
    Cancelled,
    /// Started job outlived its timeout and was swept.
    Reaped,
}

/// Worker pool lifecycle transition observed by the supervisor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SupervisorEvent {
    Starting { target_worker_count: usize },
    Ready { target_worker_count: usize },
    WorkerSpawned {
        worker_id: String,
        generation: u64,
        max_requests: u64,
    },
    /// Worker left its loop after being asked to stop.
    WorkerExited { worker_id: String },
    /// Worker hit its request budget and will be replaced.
    WorkerRecycled {
        worker_id: String,
        requests_handled: u64,
    },
    WorkerCrashed { worker_id: String, reason: String },
    /// Worker missed its liveness deadline and was terminated.
    WorkerTimedOut {
        worker_id: String,
        #[serde(with = "duration_ms")]
        silent_for: Duration,
    },
    ReloadStarted { generation: u64 },
    ReloadCompleted { generation: u64 },
    Scaled { from: usize, to: usize },
    ShutdownStarted { graceful: bool },
    ShutdownCompleted { forced_workers: usize },
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// In-process event bus using tokio broadcast channels.
///
/// Events are broadcast to all active subscribers; if a subscriber lags
/// behind, it will receive `RecvError::Lagged` but won't block the publisher.
///
/// # Characteristics
///
/// - Non-blocking publish: Publishers never wait for slow subscribers
/// - Fan-out: All subscribers receive all events (within capacity)
/// - In-process: Events don't leave the process
#[derive(Clone)]
pub struct InProcEventBus<E> {
    sender: broadcast::Sender<E>,
    capacity: usize,
}

impl<E> std::fmt::Debug for InProcEventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<E: Clone + Send + 'static> Default for InProcEventBus<E> {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl<E: Clone + Send + 'static> InProcEventBus<E> {
    /// Create a bus buffering at most `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers. With no subscribers the event is
    /// dropped.
    pub fn publish(&self, event: E) {
        let _ = self.sender.send(event);
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

pub type JobEventBus = InProcEventBus<JobEvent>;
pub type SupervisorEventBus = InProcEventBus<SupervisorEvent>;
