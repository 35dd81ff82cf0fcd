use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::config::QueueConfig;
use crate::error::{QueueError, StoreError};
use crate::events::{JobEvent, JobEventBus, JobEventKind};
use crate::job::{after_secs, EnqueueOptions, Job, JobFailure, JobId, JobStatus};
use crate::keys::KeySpace;
use crate::lease::{FailOutcome, JobLease, LeaseId, RetryPolicy};
use crate::registry::{CancellationSource, TaskRegistry};
use crate::store::{JobStore, ScoredMember};
use crate::telemetry;

pub type QueueResult<T> = Result<T, QueueError>;

/// Durable task queue layered on a [`JobStore`].
///
/// Named queues are consulted in the configured priority order and each is
/// FIFO. Delayed jobs and retries wait in a per-queue scheduled set until
/// they are due, then join the tail of the pending list. Started jobs with a
/// timeout sit in a per-queue started set keyed by their reap deadline.
///
/// All cross-worker coordination goes through the store's atomic
/// primitives: `pop_first` hands each job id to exactly one caller and every
/// record update is a compare-and-swap, so any number of queues in any
/// number of processes can share one store.
pub struct TaskQueue<S: JobStore> {
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
    config: QueueConfig,
    keys: KeySpace,
    pending_lists: Vec<String>,
    events: JobEventBus,
    wakeup: Notify,
}

impl<S: JobStore> std::fmt::Debug for TaskQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("store_type", &std::any::type_name::<S>())
            .field("queues", &self.config.queues)
            .field("namespace", &self.keys.namespace())
            .field("tasks", &self.registry.task_names())
            .finish()
    }
}

impl<S: JobStore> TaskQueue<S> {
    pub fn new(store: Arc<S>, registry: Arc<TaskRegistry>, config: QueueConfig) -> Self {
        let keys = KeySpace::default();
        let pending_lists = config.queues.iter().map(|q| keys.pending(q)).collect();
        Self {
            store,
            registry,
            config,
            keys,
            pending_lists,
            events: JobEventBus::default(),
            wakeup: Notify::new(),
        }
    }

    /// Use a custom key namespace.
    pub fn with_keys(mut self, keys: KeySpace) -> Self {
        self.pending_lists = self.config.queues.iter().map(|q| keys.pending(q)).collect();
        self.keys = keys;
        self
    }

    /// Publish job events on an existing bus.
    pub fn with_events(mut self, events: JobEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn events(&self) -> &JobEventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Create a `queued` job and make it visible to dequeue, immediately or
    /// after `delay_seconds`.
    ///
    /// Task names are resolved eagerly: an unregistered name fails here with
    /// [`QueueError::UnknownTask`] and nothing is written.
    pub async fn enqueue(
        &self,
        task_name: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        if !self.registry.contains(task_name) {
            return Err(QueueError::UnknownTask(task_name.to_string()));
        }
        if !self.config.queues.contains(&options.queue_name) {
            return Err(QueueError::UnknownQueue(options.queue_name));
        }
        options.check_bounds().map_err(QueueError::InvalidOptions)?;

        let span = telemetry::job_enqueue_span(task_name, &options.queue_name);
        async {
            let mut job = Job::new(task_name, payload, &options);
            if options.delay_seconds > 0 {
                job.scheduled_for = Some(after_secs(job.created_at, options.delay_seconds));
            }

            let encoded = serde_json::to_string(&job)?;
            self.store.set(&self.keys.job(&job.id), &encoded, None).await?;

            let member = job.id.to_string();
            match job.scheduled_for {
                Some(at) => {
                    self.store
                        .sorted_add(&self.keys.scheduled(&job.queue_name), &member, at.timestamp_millis())
                        .await?;
                }
                None => {
                    self.store
                        .push_back(&self.keys.pending(&job.queue_name), &member)
                        .await?;
                    self.wakeup.notify_waiters();
                }
            }

            debug!(job_id = %job.id, delayed = job.scheduled_for.is_some(), "job enqueued");
            telemetry::record_job_enqueued(&job.queue_name, &job.task_name);
            self.events.publish(JobEvent::new(
                job.id,
                &job.task_name,
                &job.queue_name,
                JobEventKind::Enqueued {
                    delayed: job.scheduled_for.is_some(),
                },
            ));
            Ok(job.id)
        }
        .instrument(span)
        .await
    }

    /// Hand the next visible job to `worker_id`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing became available in time; callers use
    /// that as their point to check for shutdown.
    pub async fn dequeue(&self, worker_id: &str, timeout: Duration) -> QueueResult<Option<JobLease>> {
        self.dequeue_until(worker_id, timeout, std::future::pending()).await
    }

    /// Like [`TaskQueue::dequeue`], but gives up waiting as soon as `stop`
    /// completes. Only the idle wait is cut short; a poll that is already
    /// talking to the store runs to completion, so no popped job is dropped.
    pub async fn dequeue_until<F>(
        &self,
        worker_id: &str,
        timeout: Duration,
        stop: F,
    ) -> QueueResult<Option<JobLease>>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        let deadline = Instant::now() + timeout;
        loop {
            // Created before polling so an enqueue racing with the poll still wakes us.
            let notified = self.wakeup.notified();
            if let Some(lease) = self.try_dequeue(worker_id).await? {
                return Ok(Some(lease));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(self.config.poll_interval());
            tokio::select! {
                _ = &mut stop => return Ok(None),
                _ = tokio::time::timeout(wait, notified) => {}
            }
        }
    }

    /// Single non-blocking dequeue attempt.
    pub async fn try_dequeue(&self, worker_id: &str) -> QueueResult<Option<JobLease>> {
        self.promote_scheduled().await?;
        loop {
            let Some((list, member)) = self.store.pop_first(&self.pending_lists).await? else {
                return Ok(None);
            };
            let Ok(job_id) = member.parse::<JobId>() else {
                warn!(list, member, "discarding malformed entry from pending list");
                continue;
            };
            match self.start(job_id, worker_id).await {
                Ok(Some(lease)) => return Ok(Some(lease)),
                Ok(None) => continue,
                Err(err) => {
                    // The id is already off the list; put it back rather than lose it.
                    if let Err(push_err) = self.store.push_back(&list, &member).await {
                        warn!(%job_id, error = %push_err, "could not return popped job to its queue");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Flip a popped job from `queued` to `started`. `None` means the job
    /// vanished or was cancelled between the pop and the swap.
    async fn start(&self, job_id: JobId, worker_id: &str) -> QueueResult<Option<JobLease>> {
        let key = self.keys.job(&job_id);
        let Some(raw) = self.store.get(&key).await? else {
            debug!(%job_id, "popped job has no record, skipping");
            return Ok(None);
        };
        let preview = decode(&key, &raw)?;
        if preview.status != JobStatus::Queued {
            debug!(%job_id, status = %preview.status, "popped job is no longer queued, skipping");
            return Ok(None);
        }

        let lease_id = LeaseId::new();
        let leased_at = Utc::now();
        let member = job_id.to_string();
        let started_set = self.keys.started(&preview.queue_name);

        // Register the reap deadline before the job is marked started, so a
        // crash right after the swap still leaves it reapable.
        if let Some(secs) = preview.timeout_seconds {
            let deadline = after_secs(leased_at, secs);
            self.store
                .sorted_add(&started_set, &member, deadline.timestamp_millis())
                .await?;
        }

        let updated = self
            .update(job_id, |job| {
                if job.status != JobStatus::Queued {
                    return false;
                }
                job.status = JobStatus::Started;
                job.started_at = Some(leased_at);
                job.scheduled_for = None;
                job.lease_id = Some(lease_id);
                job.worker_id = Some(worker_id.to_string());
                true
            })
            .await;

        let job = match updated {
            Ok(Some(job)) => job,
            Ok(None) | Err(QueueError::NotFound(_)) => {
                if preview.timeout_seconds.is_some() {
                    self.store.sorted_remove(&started_set, &member).await?;
                }
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        telemetry::record_job_started(&job.queue_name, &job.task_name);
        self.events.publish(JobEvent::new(
            job.id,
            &job.task_name,
            &job.queue_name,
            JobEventKind::Started {
                worker_id: worker_id.to_string(),
                attempt: job.attempt(),
            },
        ));

        Ok(Some(JobLease {
            lease_id,
            job,
            worker_id: worker_id.to_string(),
            leased_at,
        }))
    }

    /// Mark a started job `finished` with `result`. Returns false if the job
    /// was not started.
    pub async fn complete(&self, job_id: JobId, result: Value) -> QueueResult<bool> {
        self.finish(job_id, None, result).await
    }

    /// Like [`complete`](Self::complete), but only if `lease` still holds
    /// the job.
    pub async fn complete_lease(&self, lease: &JobLease, result: Value) -> QueueResult<bool> {
        self.finish(lease.job_id(), Some(lease.lease_id), result).await
    }

    async fn finish(&self, job_id: JobId, lease: Option<LeaseId>, result: Value) -> QueueResult<bool> {
        let now = Utc::now();
        let updated = self
            .update(job_id, |job| {
                if !held_by(job, lease) {
                    return false;
                }
                job.status = JobStatus::Finished;
                job.result = Some(result.clone());
                job.ended_at = Some(now);
                true
            })
            .await?;

        let Some(job) = updated else {
            debug!(%job_id, "ignoring completion for a job this attempt no longer holds");
            return Ok(false);
        };

        self.store
            .sorted_remove(&self.keys.started(&job.queue_name), &job_id.to_string())
            .await?;
        telemetry::record_job_finished(&job.queue_name, &job.task_name, JobStatus::Finished.as_str());
        self.events.publish(JobEvent::new(
            job.id,
            &job.task_name,
            &job.queue_name,
            JobEventKind::Finished,
        ));
        Ok(true)
    }

    /// Report a handler failure for a started job. The job is re-enqueued
    /// with backoff while retries remain, otherwise it becomes `failed`.
    pub async fn fail(&self, job_id: JobId, error: impl Into<String>) -> QueueResult<FailOutcome> {
        self.record_failure(job_id, None, JobFailure::handler(error)).await
    }

    /// Report a failure for the attempt identified by `lease`.
    pub async fn fail_lease(&self, lease: &JobLease, failure: JobFailure) -> QueueResult<FailOutcome> {
        self.record_failure(lease.job_id(), Some(lease.lease_id), failure)
            .await
    }

    /// Recover a job whose worker died mid-run, without waiting for the
    /// reaper. The job is requeued outside its retry budget.
    pub async fn abandon(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        worker_id: &str,
    ) -> QueueResult<FailOutcome> {
        self.record_failure(job_id, Some(lease_id), JobFailure::worker_lost(worker_id))
            .await
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        lease: Option<LeaseId>,
        failure: JobFailure,
    ) -> QueueResult<FailOutcome> {
        let now = Utc::now();
        let policy = &self.config.retry;
        let max_recoveries = self.config.max_recoveries;

        let mut outcome = FailOutcome::Stale;
        let updated = self
            .update(job_id, |job| {
                if !held_by(job, lease) {
                    return false;
                }
                job.error = Some(failure.clone());
                outcome = match FailurePlan::for_job(job, &failure, policy, max_recoveries, now) {
                    FailurePlan::Retry { delay, at } => {
                        job.retries_used += 1;
                        requeue(job, at);
                        FailOutcome::Retrying {
                            retries_used: job.retries_used,
                            delay,
                        }
                    }
                    FailurePlan::Requeue { delay, at } => {
                        job.recoveries += 1;
                        requeue(job, at);
                        FailOutcome::Requeued {
                            recoveries: job.recoveries,
                            delay,
                        }
                    }
                    FailurePlan::Fail => {
                        job.status = JobStatus::Failed;
                        job.ended_at = Some(now);
                        FailOutcome::Failed
                    }
                };
                true
            })
            .await?;

        let Some(job) = updated else {
            debug!(%job_id, "ignoring failure for a job this attempt no longer holds");
            return Ok(FailOutcome::Stale);
        };

        let member = job_id.to_string();
        self.store
            .sorted_remove(&self.keys.started(&job.queue_name), &member)
            .await?;

        match &outcome {
            FailOutcome::Retrying { retries_used, delay } => {
                telemetry::record_job_retrying(&job.queue_name, &job.task_name, *retries_used, *delay);
                self.events.publish(JobEvent::new(
                    job.id,
                    &job.task_name,
                    &job.queue_name,
                    JobEventKind::Retrying {
                        failure: failure.kind,
                        retries_used: *retries_used,
                        delay_ms: delay.as_millis() as u64,
                    },
                ));
            }
            FailOutcome::Requeued { recoveries, delay } => {
                telemetry::record_job_requeued(&job.queue_name, &job.task_name, *recoveries, *delay);
                self.events.publish(JobEvent::new(
                    job.id,
                    &job.task_name,
                    &job.queue_name,
                    JobEventKind::Requeued {
                        failure: failure.kind,
                        recoveries: *recoveries,
                        delay_ms: delay.as_millis() as u64,
                    },
                ));
            }
            FailOutcome::Failed => {
                warn!(job_id = %job.id, task = %job.task_name, error = %failure, "job failed");
                telemetry::record_job_finished(&job.queue_name, &job.task_name, JobStatus::Failed.as_str());
                self.events.publish(JobEvent::new(
                    job.id,
                    &job.task_name,
                    &job.queue_name,
                    JobEventKind::Failed {
                        failure: failure.kind,
                    },
                ));
            }
            FailOutcome::Stale => {}
        }
        Ok(outcome)
    }

    /// Cancel a job that has not started yet.
    ///
    /// Returns false for any job that is not `queued`. A `started` job is
    /// flagged with `cancel_requested` instead, which its handler may poll.
    pub async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        let now = Utc::now();
        let updated = self
            .update(job_id, |job| match job.status {
                JobStatus::Queued => {
                    job.status = JobStatus::Cancelled;
                    job.ended_at = Some(now);
                    true
                }
                JobStatus::Started if !job.cancel_requested => {
                    job.cancel_requested = true;
                    true
                }
                _ => false,
            })
            .await?;

        let Some(job) = updated else {
            return Ok(false);
        };
        if job.status != JobStatus::Cancelled {
            debug!(%job_id, "job already running, flagged for cooperative cancellation");
            return Ok(false);
        }

        let member = job_id.to_string();
        self.store
            .remove_from_list(&self.keys.pending(&job.queue_name), &member)
            .await?;
        self.store
            .sorted_remove(&self.keys.scheduled(&job.queue_name), &member)
            .await?;

        telemetry::record_job_finished(&job.queue_name, &job.task_name, JobStatus::Cancelled.as_str());
        self.events.publish(JobEvent::new(
            job.id,
            &job.task_name,
            &job.queue_name,
            JobEventKind::Cancelled,
        ));
        Ok(true)
    }

    /// Read-only snapshot of a job. Fails with [`QueueError::NotFound`] once
    /// the record has expired.
    pub async fn status(&self, job_id: JobId) -> QueueResult<Job> {
        let key = self.keys.job(&job_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        Ok(decode(&key, &raw)?)
    }

    /// Move every due delayed or retried job onto the tail of its pending
    /// list.
    pub async fn promote_scheduled(&self) -> QueueResult<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let mut moved = 0;
        for queue in &self.config.queues {
            moved += self
                .store
                .sorted_promote_due(
                    &self.keys.scheduled(queue),
                    &self.keys.pending(queue),
                    now_ms,
                    self.config.promote_batch_size,
                )
                .await?;
        }
        if moved > 0 {
            trace!(moved, "promoted scheduled jobs");
            self.wakeup.notify_waiters();
        }
        Ok(moved)
    }

    /// Requeue every started job that has outlived its `timeout_seconds`.
    /// Reaping does not use up `max_retries`; the job fails only once
    /// `max_recoveries` is exhausted. Returns how many jobs were reaped.
    pub async fn reap_expired(&self) -> QueueResult<u64> {
        let span = telemetry::reap_span();
        async {
            let now = Utc::now();
            let mut reaped = 0;
            for queue in &self.config.queues {
                let started_set = self.keys.started(queue);
                let due = self
                    .store
                    .sorted_take_due(&started_set, now.timestamp_millis(), self.config.reap_batch_size)
                    .await?;
                for (i, member) in due.iter().enumerate() {
                    let Ok(job_id) = member.parse::<JobId>() else {
                        warn!(queue, member, "discarding malformed entry from started set");
                        continue;
                    };
                    match self.reap_one(job_id, now).await {
                        Ok(true) => reaped += 1,
                        Ok(false) | Err(QueueError::NotFound(_)) => {}
                        Err(err) if err.is_transient() => {
                            warn!(%job_id, error = %err, "reaping interrupted, will retry next sweep");
                            // Everything taken but not yet handled goes back.
                            self.restore_started(&started_set, &due[i..], now).await?;
                            return Err(err);
                        }
                        Err(err) => {
                            warn!(%job_id, error = %err, "reaping failed, will retry next sweep");
                            self.restore_started(&started_set, std::slice::from_ref(member), now)
                                .await?;
                        }
                    }
                }
            }
            if reaped > 0 {
                info!(reaped, "reaped stale started jobs");
            }
            Ok(reaped)
        }
        .instrument(span)
        .await
    }

    /// Put taken started-set entries back, due immediately.
    async fn restore_started(
        &self,
        started_set: &str,
        members: &[String],
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        for member in members {
            if let Err(err) = self
                .store
                .sorted_add(started_set, member, now.timestamp_millis())
                .await
            {
                error!(job_id = %member, error = %err, "could not return job to the reaper's watch list");
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn reap_one(&self, job_id: JobId, now: DateTime<Utc>) -> QueueResult<bool> {
        let job = self.status(job_id).await?;
        if job.status != JobStatus::Started {
            return Ok(false);
        }
        let (Some(timeout), Some(started_at)) = (job.timeout_seconds, job.started_at) else {
            return Ok(false);
        };
        let deadline = after_secs(started_at, timeout);
        if deadline > now {
            // Restarted since the entry was scored; keep watching it.
            self.store
                .sorted_add(
                    &self.keys.started(&job.queue_name),
                    &job_id.to_string(),
                    deadline.timestamp_millis(),
                )
                .await?;
            return Ok(false);
        }

        let outcome = self
            .record_failure(job_id, job.lease_id, JobFailure::timed_out(timeout))
            .await?;
        if outcome == FailOutcome::Stale {
            return Ok(false);
        }
        telemetry::record_job_reaped(&job.queue_name, &job.task_name);
        self.events.publish(JobEvent::new(
            job.id,
            &job.task_name,
            &job.queue_name,
            JobEventKind::Reaped,
        ));
        Ok(true)
    }

    /// Pending, scheduled and started depth of every configured queue.
    pub async fn snapshot(&self) -> QueueResult<QueueSnapshot> {
        let mut snapshot = QueueSnapshot::new(Utc::now());
        for queue in &self.config.queues {
            let depth = QueueDepth {
                name: queue.clone(),
                pending: self.store.list_len(&self.keys.pending(queue)).await?,
                scheduled: self.store.sorted_len(&self.keys.scheduled(queue)).await?,
                started: self.store.sorted_len(&self.keys.started(queue)).await?,
            };
            telemetry::set_queue_depth(queue, "pending", depth.pending);
            telemetry::set_queue_depth(queue, "scheduled", depth.scheduled);
            telemetry::set_queue_depth(queue, "started", depth.started);
            snapshot.queues.push(depth);
        }
        Ok(snapshot)
    }

    /// Read-modify-write of one job record through compare-and-swap.
    ///
    /// `apply` returns false to leave the record untouched. It may run more
    /// than once when another writer wins the race. Terminal records are
    /// written with their result TTL.
    async fn update<F>(&self, job_id: JobId, mut apply: F) -> QueueResult<Option<Job>>
    where
        F: FnMut(&mut Job) -> bool + Send,
    {
        let key = self.keys.job(&job_id);
        for _ in 0..self.config.cas_attempts {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or(QueueError::NotFound(job_id))?;
            let mut job = decode(&key, &raw)?;
            let before = job.status;
            if !apply(&mut job) {
                return Ok(None);
            }
            debug_assert!(
                before == job.status || before.can_transition_to(job.status),
                "illegal transition {before} -> {}",
                job.status
            );
            let encoded = serde_json::to_string(&job)?;
            let swapped = match (before, job.status, job.scheduled_for) {
                // A requeued record and its schedule entry land together, so
                // a failed write can never leave a queued job in no list.
                (JobStatus::Started, JobStatus::Queued, Some(at)) => {
                    let member = job_id.to_string();
                    let scheduled = self.keys.scheduled(&job.queue_name);
                    let entry = ScoredMember {
                        set: &scheduled,
                        member: &member,
                        score: at.timestamp_millis(),
                    };
                    self.store
                        .compare_and_swap_scheduled(&key, &raw, &encoded, entry)
                        .await?
                }
                _ => {
                    let ttl = job
                        .status
                        .is_terminal()
                        .then(|| Duration::from_secs(job.result_ttl_seconds));
                    self.store.compare_and_swap(&key, &raw, &encoded, ttl).await?
                }
            };
            if swapped {
                return Ok(Some(job));
            }
            trace!(%job_id, "job record changed during update, retrying");
        }
        Err(QueueError::Contention(job_id))
    }
}

/// What a failed attempt does to its job.
#[derive(Clone, Copy, Debug)]
enum FailurePlan {
    /// Handler failure with retries left.
    Retry { delay: Duration, at: DateTime<Utc> },
    /// Lost attempt, put back outside the retry budget.
    Requeue { delay: Duration, at: DateTime<Utc> },
    Fail,
}

impl FailurePlan {
    fn for_job(
        job: &Job,
        failure: &JobFailure,
        policy: &RetryPolicy,
        max_recoveries: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        if failure.kind.is_lost_attempt() {
            if max_recoveries.is_none_or(|max| job.recoveries < max) {
                let delay = policy.delay_for(job.recoveries);
                return FailurePlan::Requeue {
                    delay,
                    at: after_delay(now, delay),
                };
            }
        } else if failure.kind.is_retryable() && job.retries_used < job.max_retries {
            let delay = policy.delay_for(job.retries_used);
            return FailurePlan::Retry {
                delay,
                at: after_delay(now, delay),
            };
        }
        FailurePlan::Fail
    }
}

fn requeue(job: &mut Job, at: DateTime<Utc>) {
    job.status = JobStatus::Queued;
    job.started_at = None;
    job.lease_id = None;
    job.worker_id = None;
    job.scheduled_for = Some(at);
}

fn after_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn held_by(job: &Job, lease: Option<LeaseId>) -> bool {
    job.status == JobStatus::Started && lease.is_none_or(|lease| job.lease_id == Some(lease))
}

fn decode(key: &str, raw: &str) -> Result<Job, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl<S: JobStore> CancellationSource for TaskQueue<S> {
    async fn cancel_requested(&self, job_id: JobId) -> bool {
        match self.status(job_id).await {
            Ok(job) => job.cancel_requested,
            Err(err) => {
                debug!(%job_id, error = %err, "could not read cancellation flag");
                false
            }
        }
    }
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-queue depths, in priority order.
    pub queues: Vec<QueueDepth>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: Vec::new(),
        }
    }

    pub fn get(&self, queue: &str) -> Option<&QueueDepth> {
        self.queues.iter().find(|depth| depth.name == queue)
    }

    /// Jobs waiting in pending lists across all queues.
    pub fn total_pending(&self) -> usize {
        self.queues.iter().map(|depth| depth.pending).sum()
    }
}

/// Depth of a single named queue.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueDepth {
    pub name: String,
    /// Jobs visible to dequeue.
    pub pending: usize,
    /// Delayed or backing-off jobs not yet visible.
    pub scheduled: usize,
    /// Running jobs being watched for timeout.
    pub started: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::RetryPolicy;
    use crate::registry::handler_fn;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn queue_with(config: QueueConfig) -> TaskQueue<MemoryStore> {
        let registry = TaskRegistry::new()
            .with_handler("echo", handler_fn(|_ctx, payload| async move { Ok(payload) }));
        TaskQueue::new(Arc::new(MemoryStore::new()), Arc::new(registry), config)
    }

    fn queue() -> TaskQueue<MemoryStore> {
        queue_with(
            QueueConfig::default()
                .with_queues(["high", "default"])
                .with_retry(RetryPolicy::new(10, 40))
                .with_poll_interval(5),
        )
    }

    #[tokio::test]
    async fn unknown_task_and_queue_are_rejected_eagerly() {
        let queue = queue();
        let err = queue
            .enqueue("nope", Value::Null, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownTask(name) if name == "nope"));

        let err = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default().with_queue("low"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(name) if name == "low"));
        assert_eq!(queue.snapshot().await.unwrap().total_pending(), 0);
    }

    #[tokio::test]
    async fn dequeue_marks_started_and_complete_finishes() {
        let queue = queue();
        let id = queue
            .enqueue("echo", json!({"x": 1}), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(queue.status(id).await.unwrap().status, JobStatus::Queued);

        let lease = queue.try_dequeue("w0").await.unwrap().expect("job available");
        assert_eq!(lease.job_id(), id);
        let job = queue.status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Started);
        assert_eq!(job.worker_id.as_deref(), Some("w0"));
        assert!(job.started_at.is_some());

        assert!(queue.complete_lease(&lease, json!({"x": 1})).await.unwrap());
        let job = queue.status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.result, Some(json!({"x": 1})));
        assert!(job.ended_at.is_some());

        // A second completion is a no-op.
        assert!(!queue.complete(id, Value::Null).await.unwrap());
    }

    #[tokio::test]
    async fn dequeue_times_out_with_none() {
        let queue = queue();
        let started = Instant::now();
        let lease = queue.dequeue("w0", Duration::from_millis(30)).await.unwrap();
        assert!(lease.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn waiting_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(queue_with(
            QueueConfig::default().with_poll_interval(10_000),
        ));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue("w0", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default())
            .await
            .unwrap();

        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke up")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lease.job_id(), id);
    }

    #[tokio::test]
    async fn stale_lease_cannot_finish_a_released_job() {
        let queue = queue();
        let id = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default().with_max_retries(1))
            .await
            .unwrap();
        let first = queue.try_dequeue("w0").await.unwrap().unwrap();
        let outcome = queue.abandon(id, first.lease_id, "w0").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Requeued { recoveries: 1, .. }));
        assert_eq!(queue.status(id).await.unwrap().retries_used, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = queue.try_dequeue("w1").await.unwrap().unwrap();
        assert_eq!(second.job_id(), id);

        assert!(!queue.complete_lease(&first, Value::Null).await.unwrap());
        assert_eq!(
            queue.fail_lease(&first, JobFailure::handler("late")).await.unwrap(),
            FailOutcome::Stale
        );
        assert!(queue.complete_lease(&second, Value::Null).await.unwrap());
    }

    #[tokio::test]
    async fn reaped_jobs_are_requeued_without_a_retry_budget() {
        let queue = queue();
        let id = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default().with_timeout(1))
            .await
            .unwrap();
        let first = queue.try_dequeue("w0").await.unwrap().unwrap();
        assert_eq!(first.job.attempt(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(queue.reap_expired().await.unwrap(), 1);

        let job = queue.status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.recoveries, 1);
        assert_eq!(job.retries_used, 0);
        assert_eq!(job.error.unwrap().kind, crate::job::FailureKind::TimedOut);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = queue.try_dequeue("w1").await.unwrap().expect("requeued job");
        assert_eq!(second.job_id(), id);
        assert_eq!(second.job.attempt(), 2);
        assert!(queue.complete_lease(&second, Value::Null).await.unwrap());
    }

    #[tokio::test]
    async fn lost_attempts_fail_once_recoveries_run_out() {
        let queue = queue_with(
            QueueConfig::default()
                .with_retry(RetryPolicy::new(1, 1))
                .with_poll_interval(5)
                .with_max_recoveries(1),
        );
        let id = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default().with_max_retries(5))
            .await
            .unwrap();

        let first = queue.try_dequeue("w0").await.unwrap().unwrap();
        let outcome = queue.abandon(id, first.lease_id, "w0").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Requeued { recoveries: 1, .. }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = queue.try_dequeue("w1").await.unwrap().unwrap();
        let outcome = queue.abandon(id, second.lease_id, "w1").await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let job = queue.status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.recoveries, 1);
        assert_eq!(job.retries_used, 0);
        assert_eq!(job.error.unwrap().kind, crate::job::FailureKind::WorkerLost);
    }

    #[tokio::test]
    async fn out_of_range_durations_are_rejected_before_writing() {
        let queue = queue();
        for options in [
            EnqueueOptions::default().with_timeout(u64::MAX),
            EnqueueOptions::default().with_timeout(100_000_000_000_000_000),
            EnqueueOptions::default().with_delay(100_000_000_000_000_000),
            EnqueueOptions::default().with_result_ttl(u64::MAX),
        ] {
            let err = queue.enqueue("echo", Value::Null, options).await.unwrap_err();
            assert!(matches!(err, QueueError::InvalidOptions(_)), "{err:?}");
        }
        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.total_pending(), 0);
        assert_eq!(queue.store().sorted_len(&queue.keys().scheduled("default")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fail_without_retries_is_terminal() {
        let queue = queue();
        let id = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default())
            .await
            .unwrap();
        queue.try_dequeue("w0").await.unwrap().unwrap();

        assert_eq!(queue.fail(id, "boom").await.unwrap(), FailOutcome::Failed);
        let job = queue.status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().message, "boom");
        assert_eq!(job.retries_used, 0);
    }

    #[tokio::test]
    async fn unknown_task_failures_are_not_retried() {
        let queue = queue();
        let id = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default().with_max_retries(3))
            .await
            .unwrap();
        let lease = queue.try_dequeue("w0").await.unwrap().unwrap();
        let outcome = queue
            .fail_lease(&lease, JobFailure::unknown_task("echo"))
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
        assert_eq!(queue.status(id).await.unwrap().retries_used, 0);
    }

    #[tokio::test]
    async fn cancel_only_applies_to_queued_jobs() {
        let queue = queue();
        let queued = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default())
            .await
            .unwrap();
        assert!(queue.cancel(queued).await.unwrap());
        assert_eq!(queue.status(queued).await.unwrap().status, JobStatus::Cancelled);
        assert!(queue.try_dequeue("w0").await.unwrap().is_none());
        assert!(!queue.cancel(queued).await.unwrap());

        let running = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default())
            .await
            .unwrap();
        queue.try_dequeue("w0").await.unwrap().unwrap();
        assert!(!queue.cancel(running).await.unwrap());
        let job = queue.status(running).await.unwrap();
        assert_eq!(job.status, JobStatus::Started);
        assert!(job.cancel_requested);
        assert!(queue.cancel_requested(running).await);
    }

    #[tokio::test]
    async fn cancel_removes_delayed_jobs_from_the_schedule() {
        let queue = queue();
        let id = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default().with_delay(60))
            .await
            .unwrap();
        assert_eq!(queue.snapshot().await.unwrap().get("default").unwrap().scheduled, 1);
        assert!(queue.cancel(id).await.unwrap());
        assert_eq!(queue.snapshot().await.unwrap().get("default").unwrap().scheduled, 0);
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let queue = queue();
        let id = JobId::new();
        assert!(matches!(queue.status(id).await, Err(QueueError::NotFound(missing)) if missing == id));
        assert!(matches!(queue.cancel(id).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_records_expire_after_result_ttl() {
        let queue = queue();
        let id = queue
            .enqueue("echo", Value::Null, EnqueueOptions::default().with_result_ttl(10))
            .await
            .unwrap();
        let lease = queue.try_dequeue("w0").await.unwrap().unwrap();
        queue.complete_lease(&lease, json!("done")).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(queue.status(id).await.unwrap().status, JobStatus::Finished);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(queue.status(id).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn corrupt_records_surface_as_store_errors() {
        let queue = queue();
        let id = JobId::new();
        queue
            .store()
            .set(&queue.keys().job(&id), "{not json", None)
            .await
            .unwrap();
        let err = queue.status(id).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(StoreError::Corrupt { .. })));
    }
}
