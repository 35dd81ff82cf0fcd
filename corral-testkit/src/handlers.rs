use async_trait::async_trait;
use corral::{JobContext, JobId, TaskHandler};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What a [`RecordingHandler`] does when invoked.
#[derive(Clone, Debug)]
pub enum Behaviour {
    /// Return the payload unchanged.
    Echo,
    /// Return a fixed value.
    Succeed(Value),
    /// Return an error with this message on every attempt.
    Fail(String),
    /// Fail the first `n` attempts of each job, then echo.
    FailTimes(u32),
    /// Sleep without heartbeating, then echo.
    Sleep(Duration),
    /// Sleep, heartbeating every `interval`, then echo.
    SleepWithHeartbeat { total: Duration, interval: Duration },
    /// Panic inside the handler.
    Panic(String),
}

#[derive(Clone, Debug)]
pub struct Invocation {
    pub job_id: JobId,
    pub attempt: u32,
    pub worker_id: String,
    pub payload: Value,
    pub at: Instant,
}

/// Task handler that records every invocation before acting out its
/// [`Behaviour`]. Clones share the same record.
#[derive(Clone)]
pub struct RecordingHandler {
    behaviour: Arc<Mutex<Behaviour>>,
    invocations: Arc<Mutex<Vec<Invocation>>>,
    invoked: Arc<Notify>,
}

impl RecordingHandler {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour: Arc::new(Mutex::new(behaviour)),
            invocations: Arc::new(Mutex::new(Vec::new())),
            invoked: Arc::new(Notify::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new(Behaviour::Echo)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(Behaviour::Fail(message.into()))
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock() = behaviour;
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.invocations.lock().len()
    }

    /// Invocations for one job, in call order.
    pub fn attempts_for(&self, job_id: JobId) -> Vec<Invocation> {
        self.invocations
            .lock()
            .iter()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Wait until at least `n` invocations were recorded.
    pub async fn wait_for_count(&self, n: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.invoked.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    pub fn assert_count_eq(&self, expected: usize) {
        let actual = self.count();
        assert_eq!(actual, expected, "expected {expected} invocations, got {actual}");
    }

    fn record(&self, ctx: &JobContext, payload: &Value) -> u32 {
        let mut invocations = self.invocations.lock();
        invocations.push(Invocation {
            job_id: ctx.job_id,
            attempt: ctx.attempt,
            worker_id: ctx.worker_id.clone(),
            payload: payload.clone(),
            at: Instant::now(),
        });
        let seen = invocations.iter().filter(|i| i.job_id == ctx.job_id).count();
        drop(invocations);
        self.invoked.notify_waiters();
        seen as u32
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, ctx: JobContext, payload: Value) -> anyhow::Result<Value> {
        let seen = self.record(&ctx, &payload);
        let behaviour = self.behaviour.lock().clone();

        match behaviour {
            Behaviour::Echo => Ok(payload),
            Behaviour::Succeed(value) => Ok(value),
            Behaviour::Fail(message) => Err(anyhow::anyhow!(message)),
            Behaviour::FailTimes(n) if seen <= n => {
                Err(anyhow::anyhow!("planned failure {seen} of {n}"))
            }
            Behaviour::FailTimes(_) => Ok(payload),
            Behaviour::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(payload)
            }
            Behaviour::SleepWithHeartbeat { total, interval } => {
                let deadline = Instant::now() + total;
                while Instant::now() < deadline {
                    ctx.heartbeat();
                    tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now())))
                        .await;
                }
                Ok(payload)
            }
            Behaviour::Panic(message) => panic!("{message}"),
        }
    }
}
