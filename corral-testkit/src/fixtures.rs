use corral::{
    Job, JobId, JobStatus, JobStore, QueueConfig, RetryPolicy, SupervisorConfig,
    SupervisorHandle, SupervisorStatus, TaskQueue, TaskRegistry,
};
use std::sync::Arc;
use std::time::Duration;

/// Queue settings with millisecond polling and retry delays.
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig::default()
        .with_poll_interval(5)
        .with_retry(RetryPolicy::new(10, 80))
}

/// Supervisor settings that react within tens of milliseconds. Recycling is
/// off unless a test turns it on.
pub fn fast_supervisor_config(workers: usize) -> SupervisorConfig {
    SupervisorConfig {
        target_worker_count: workers,
        max_requests: 0,
        max_requests_jitter: 0,
        worker_timeout_ms: 2_000,
        graceful_timeout_ms: 2_000,
        monitor_interval_ms: 10,
        reap_interval_ms: 25,
        dequeue_timeout_ms: 20,
        proc_name: "test".to_string(),
    }
}

pub fn queue_with<S: JobStore>(
    store: Arc<S>,
    registry: TaskRegistry,
    config: QueueConfig,
) -> Arc<TaskQueue<S>> {
    Arc::new(TaskQueue::new(store, Arc::new(registry), config))
}

/// Poll until the job reaches `status`, returning the record.
pub async fn wait_for_status<S: JobStore>(
    queue: &TaskQueue<S>,
    job_id: JobId,
    status: JobStatus,
    timeout: Duration,
) -> anyhow::Result<Job> {
    tokio::time::timeout(timeout, async {
        loop {
            let job = queue.status(job_id).await?;
            if job.status == status {
                return Ok::<_, anyhow::Error>(job);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("job {job_id} did not reach {status} within {timeout:?}"))?
}

/// Poll the supervisor until `check` holds, returning the matching status.
pub async fn wait_for_pool(
    handle: &SupervisorHandle,
    timeout: Duration,
    check: impl Fn(&SupervisorStatus) -> bool,
) -> anyhow::Result<SupervisorStatus> {
    tokio::time::timeout(timeout, async {
        loop {
            let status = handle.status();
            if check(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("pool did not reach the expected state within {timeout:?}"))
}
