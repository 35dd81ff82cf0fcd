use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::job::JobId;

/// User code run for one task name.
///
/// Returning `Err` is a handler failure and feeds the retry policy. Handlers
/// may run more than once for the same job (at-least-once delivery), so they
/// must be idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, payload: Value) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler.
///
/// ```ignore
/// registry.register("echo", handler_fn(|_ctx, payload| async move { Ok(payload) }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: Value) -> anyhow::Result<Value> {
        (self.f)(ctx, payload).await
    }
}

/// Task name to handler lookup, built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `task_name`, replacing any previous one.
    pub fn register(
        &mut self,
        task_name: impl Into<String>,
        handler: impl TaskHandler,
    ) -> &mut Self {
        self.handlers.insert(task_name.into(), Arc::new(handler));
        self
    }

    pub fn with_handler(mut self, task_name: impl Into<String>, handler: impl TaskHandler) -> Self {
        self.register(task_name, handler);
        self
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_name).cloned()
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Liveness value a worker refreshes and the supervisor polls.
#[derive(Clone, Debug)]
pub struct LivenessToken {
    last_beat: Arc<Mutex<Instant>>,
}

impl Default for LivenessToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessToken {
    pub fn new() -> Self {
        Self {
            last_beat: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn beat(&self) {
        *self.last_beat.lock() = Instant::now();
    }

    /// Time since the last beat.
    pub fn silent_for(&self) -> Duration {
        self.last_beat.lock().elapsed()
    }
}

/// Read access to a job's cancellation flag.
#[async_trait]
pub trait CancellationSource: Send + Sync {
    async fn cancel_requested(&self, job_id: JobId) -> bool;
}

struct NeverCancelled;

#[async_trait]
impl CancellationSource for NeverCancelled {
    async fn cancel_requested(&self, _job_id: JobId) -> bool {
        false
    }
}

/// Everything a handler can see about the job it is running.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub task_name: String,
    pub queue_name: String,
    /// 1 on the first run, incremented per retry.
    pub attempt: u32,
    pub worker_id: String,
    liveness: LivenessToken,
    cancellation: Arc<dyn CancellationSource>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("task_name", &self.task_name)
            .field("queue_name", &self.queue_name)
            .field("attempt", &self.attempt)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        task_name: impl Into<String>,
        queue_name: impl Into<String>,
        attempt: u32,
        worker_id: impl Into<String>,
        liveness: LivenessToken,
        cancellation: Arc<dyn CancellationSource>,
    ) -> Self {
        Self {
            job_id,
            task_name: task_name.into(),
            queue_name: queue_name.into(),
            attempt,
            worker_id: worker_id.into(),
            liveness,
            cancellation,
        }
    }

    /// Context not attached to any worker or queue, for calling handlers
    /// directly.
    pub fn detached(job_id: JobId, task_name: impl Into<String>) -> Self {
        Self::new(
            job_id,
            task_name,
            crate::job::DEFAULT_QUEUE,
            1,
            "detached",
            LivenessToken::new(),
            Arc::new(NeverCancelled),
        )
    }

    /// Refresh the worker's liveness from inside a long-running handler.
    /// Handlers that run longer than the supervisor's `worker_timeout`
    /// without calling this are treated as hung.
    pub fn heartbeat(&self) {
        self.liveness.beat();
    }

    /// Whether someone asked to cancel this job while it was running.
    pub async fn is_cancel_requested(&self) -> bool {
        self.cancellation.cancel_requested(self.job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closures_register_as_handlers() {
        let registry = TaskRegistry::new()
            .with_handler("echo", handler_fn(|_ctx, payload| async move { Ok(payload) }))
            .with_handler(
                "boom",
                handler_fn(|_ctx, _payload| async move { anyhow::bail!("always fails") }),
            );

        assert_eq!(registry.task_names(), vec!["boom", "echo"]);
        assert!(!registry.contains("missing"));

        let ctx = JobContext::detached(JobId::new(), "echo");
        let echo = registry.get("echo").unwrap();
        assert_eq!(echo.handle(ctx.clone(), json!({"x": 1})).await.unwrap(), json!({"x": 1}));

        let boom = registry.get("boom").unwrap();
        assert!(boom.handle(ctx, Value::Null).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_resets_silence() {
        let token = LivenessToken::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(token.silent_for() >= Duration::from_secs(5));

        let ctx = JobContext::new(
            JobId::new(),
            "slow",
            "default",
            1,
            "w0",
            token.clone(),
            Arc::new(NeverCancelled),
        );
        ctx.heartbeat();
        assert!(token.silent_for() < Duration::from_secs(1));
        assert!(!ctx.is_cancel_requested().await);
    }
}
