use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn, Instrument};

use crate::job::{JobFailure, JobId};
use crate::lease::{FailOutcome, JobLease, LeaseId};
use crate::queue::TaskQueue;
use crate::registry::{CancellationSource, JobContext, LivenessToken};
use crate::store::JobStore;
use crate::telemetry;

use super::supervisor::ShutdownToken;

/// Attempts made to record a job outcome before leaving it to the reaper.
const REPORT_ATTEMPTS: u32 = 5;

/// Configuration for individual workers in the pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique identifier for this worker.
    pub worker_id: String,
    /// Reload generation the worker was spawned under.
    pub generation: u64,
    /// Bounded wait of each dequeue, in milliseconds. A stop request ends the
    /// wait early.
    pub dequeue_timeout_ms: u64,
    /// First backoff after a store failure, in milliseconds.
    pub store_backoff_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub store_backoff_max_ms: u64,
    /// Jobs handled before the worker exits for recycling. 0 disables.
    pub max_requests: u64,
}

impl WorkerConfig {
    /// Create a new worker configuration with the given worker ID.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_dequeue_timeout(mut self, ms: u64) -> Self {
        self.dequeue_timeout_ms = ms;
        self
    }

    /// Set the store failure backoff range.
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.store_backoff_ms = initial_ms;
        self.store_backoff_max_ms = max_ms;
        self
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "default-worker".to_string(),
            generation: 0,
            dequeue_timeout_ms: 1000,
            store_backoff_ms: 100,
            store_backoff_max_ms: 5000,
            max_requests: 0,
        }
    }
}

/// Lifecycle of one worker: `starting → idle ↔ busy → stopping → dead`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Idle = 1,
    Busy = 2,
    Stopping = 3,
    Dead = 4,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Stopping => "stopping",
            WorkerState::Dead => "dead",
        }
    }

    /// Idle and busy workers are the pool's advertised capacity.
    pub fn is_ready(&self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Busy)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Starting,
            1 => WorkerState::Idle,
            2 => WorkerState::Busy,
            3 => WorkerState::Stopping,
            _ => WorkerState::Dead,
        }
    }
}

/// State a worker shares with its supervisor.
///
/// The worker writes state, current job and counters; the supervisor reads
/// them and may request a stop. Nothing here is ever locked across an await.
#[derive(Debug)]
pub struct WorkerShared {
    id: String,
    generation: u64,
    max_requests: u64,
    started_at: DateTime<Utc>,
    state: AtomicU8,
    requests_handled: AtomicU64,
    current: Mutex<Option<(JobId, LeaseId)>>,
    liveness: LivenessToken,
    stop: ShutdownToken,
}

impl WorkerShared {
    fn new(config: &WorkerConfig) -> Self {
        Self {
            id: config.worker_id.clone(),
            generation: config.generation,
            max_requests: config.max_requests,
            started_at: Utc::now(),
            state: AtomicU8::new(WorkerState::Starting as u8),
            requests_handled: AtomicU64::new(0),
            current: Mutex::new(None),
            liveness: LivenessToken::new(),
            stop: ShutdownToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests_handled.load(Ordering::SeqCst)
    }

    /// Job and lease the worker is executing right now.
    pub fn current_job(&self) -> Option<(JobId, LeaseId)> {
        *self.current.lock()
    }

    pub fn liveness(&self) -> &LivenessToken {
        &self.liveness
    }

    /// Ask the worker to exit after its current job or dequeue wait.
    pub fn request_stop(&self) {
        self.transition(
            &[WorkerState::Starting, WorkerState::Idle, WorkerState::Busy],
            WorkerState::Stopping,
        );
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn mark_dead(&self) {
        self.state.store(WorkerState::Dead as u8, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.id.clone(),
            generation: self.generation,
            state: self.state(),
            current_job_id: self.current_job().map(|(job_id, _)| job_id),
            requests_handled: self.requests_handled(),
            max_requests: self.max_requests,
            started_at: self.started_at,
        }
    }

    /// Move to `to` only from one of `from`, so a pending stop is never
    /// overwritten by the worker's own idle/busy bookkeeping.
    fn transition(&self, from: &[WorkerState], to: WorkerState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if !from.contains(&WorkerState::from_u8(current)) {
                return false;
            }
            match self
                .state
                .compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn begin_job(&self, job_id: JobId, lease_id: LeaseId) {
        *self.current.lock() = Some((job_id, lease_id));
        self.transition(&[WorkerState::Idle], WorkerState::Busy);
    }

    fn end_job(&self) {
        *self.current.lock() = None;
        self.requests_handled.fetch_add(1, Ordering::SeqCst);
        self.transition(&[WorkerState::Busy], WorkerState::Idle);
    }

    fn budget_exhausted(&self) -> bool {
        self.max_requests > 0 && self.requests_handled() >= self.max_requests
    }
}

/// Point-in-time view of a worker for status queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub generation: u64,
    pub state: WorkerState,
    pub current_job_id: Option<JobId>,
    pub requests_handled: u64,
    pub max_requests: u64,
    pub started_at: DateTime<Utc>,
}

/// Why a worker loop returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerExit {
    /// A stop was requested.
    Stopped,
    /// The request budget was used up.
    Recycled { requests_handled: u64 },
}

/// Pulls one job at a time from a [`TaskQueue`] and runs its handler.
pub struct Worker<S: JobStore> {
    config: WorkerConfig,
    queue: Arc<TaskQueue<S>>,
    shared: Arc<WorkerShared>,
}

impl<S: JobStore> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl<S: JobStore> Worker<S> {
    pub fn new(config: WorkerConfig, queue: Arc<TaskQueue<S>>) -> Self {
        let shared = Arc::new(WorkerShared::new(&config));
        Self {
            config,
            queue,
            shared,
        }
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    /// Run until stopped or recycled.
    ///
    /// Stop requests are honoured between jobs: an idle worker stops waiting
    /// for work at once, a busy one after its handler returns. Handler
    /// panics propagate and end the task; the supervisor treats that as a
    /// crash.
    pub async fn run(self) -> WorkerExit {
        let shared = &self.shared;
        shared.transition(&[WorkerState::Starting], WorkerState::Idle);
        info!(
            worker_id = %shared.id,
            generation = shared.generation,
            max_requests = shared.max_requests,
            "worker started"
        );

        let mut backoff = self.initial_backoff();
        let exit = loop {
            shared.liveness.beat();
            if shared.is_stop_requested() {
                break WorkerExit::Stopped;
            }
            if shared.budget_exhausted() {
                break WorkerExit::Recycled {
                    requests_handled: shared.requests_handled(),
                };
            }

            let dequeued = self
                .queue
                .dequeue_until(&shared.id, self.config.dequeue_timeout(), shared.stop.cancelled())
                .instrument(telemetry::job_dequeue_span(&shared.id))
                .await;

            match dequeued {
                Ok(Some(lease)) => {
                    backoff = self.initial_backoff();
                    self.execute(lease).await;
                }
                Ok(None) => {
                    backoff = self.initial_backoff();
                }
                Err(err) => {
                    if err.is_transient() {
                        telemetry::record_store_unavailable("dequeue", &err);
                    } else {
                        error!(worker_id = %shared.id, error = %err, "dequeue failed");
                    }
                    self.pause(backoff).await;
                    backoff = self.next_backoff(backoff);
                }
            }
        };

        shared.transition(
            &[WorkerState::Starting, WorkerState::Idle, WorkerState::Busy],
            WorkerState::Stopping,
        );
        info!(worker_id = %shared.id, ?exit, requests_handled = shared.requests_handled(), "worker exiting");
        shared.mark_dead();
        exit
    }

    async fn execute(&self, lease: JobLease) {
        let shared = &self.shared;
        let job = &lease.job;
        shared.begin_job(job.id, lease.lease_id);

        let outcome = match self.queue.registry().get(&job.task_name) {
            None => {
                warn!(job_id = %job.id, task = %job.task_name, "no handler registered for task");
                Err(JobFailure::unknown_task(&job.task_name))
            }
            Some(handler) => {
                let cancellation: Arc<dyn CancellationSource> = self.queue.clone();
                let ctx = JobContext::new(
                    job.id,
                    &job.task_name,
                    &job.queue_name,
                    job.attempt(),
                    &shared.id,
                    shared.liveness.clone(),
                    cancellation,
                );
                let timing = telemetry::record_job_start(job.id.to_string());
                let result = handler
                    .handle(ctx, job.payload.clone())
                    .instrument(telemetry::job_execute_span(job.id, &job.task_name, job.attempt()))
                    .await;
                let status = if result.is_ok() { "finished" } else { "failed" };
                telemetry::record_job_end(timing, &job.queue_name, &job.task_name, status);
                result.map_err(|err| JobFailure::handler(format!("{err:#}")))
            }
        };

        shared.liveness.beat();
        self.report(&lease, outcome).await;
        shared.end_job();
    }

    /// Record the outcome, retrying transient store failures with backoff.
    /// If every attempt fails the job stays `started` until reaped.
    async fn report(&self, lease: &JobLease, outcome: Result<Value, JobFailure>) {
        let job_id = lease.job_id();
        let mut backoff = self.initial_backoff();
        for attempt in 1..=REPORT_ATTEMPTS {
            let reported = match &outcome {
                Ok(result) => self
                    .queue
                    .complete_lease(lease, result.clone())
                    .await
                    .map(|held| held.then_some(())),
                Err(failure) => self
                    .queue
                    .fail_lease(lease, failure.clone())
                    .await
                    .map(|recorded| (recorded != FailOutcome::Stale).then_some(())),
            };
            match reported {
                Ok(Some(())) => return,
                Ok(None) => {
                    debug!(%job_id, "lease lost before the outcome was recorded");
                    return;
                }
                Err(err) if err.is_transient() && attempt < REPORT_ATTEMPTS => {
                    telemetry::record_store_unavailable("report_outcome", &err);
                    self.shared.liveness.beat();
                    tokio::time::sleep(backoff).await;
                    backoff = self.next_backoff(backoff);
                }
                Err(err) => {
                    error!(%job_id, error = %err, "could not record job outcome, leaving it to the reaper");
                    return;
                }
            }
        }
    }

    /// Sleep after a failure, waking early on a stop request.
    /// Back off between failed store calls. Liveness is refreshed at least
    /// once per dequeue timeout so a long outage is not mistaken for a hang.
    async fn pause(&self, delay: Duration) {
        let deadline = tokio::time::Instant::now() + delay;
        let slice = self.config.dequeue_timeout().max(Duration::from_millis(1));
        loop {
            self.shared.liveness.beat();
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep((deadline - now).min(slice)) => {}
                _ = self.shared.stop.cancelled() => return,
            }
        }
    }

    fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.config.store_backoff_ms.max(1))
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(Duration::from_millis(self.config.store_backoff_max_ms.max(1)))
    }
}
