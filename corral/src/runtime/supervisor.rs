use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::default_worker_count;
use crate::events::{SupervisorEvent, SupervisorEventBus};
use crate::queue::TaskQueue;
use crate::store::JobStore;
use crate::telemetry;

use super::worker::{Worker, WorkerConfig, WorkerExit, WorkerShared, WorkerSnapshot, WorkerState};

/// Token for signaling shutdown to long-running tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the worker supervisor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Workers kept running in the current generation.
    pub target_worker_count: usize,
    /// Jobs a worker handles before it is recycled. 0 disables recycling.
    pub max_requests: u64,
    /// Upper bound of the random offset added to `max_requests` per worker.
    pub max_requests_jitter: u64,
    /// Liveness silence after which a worker is considered hung.
    pub worker_timeout_ms: u64,
    /// How long graceful shutdown waits for in-flight jobs.
    pub graceful_timeout_ms: u64,
    /// Interval between worker health passes.
    pub monitor_interval_ms: u64,
    /// Interval between started-job sweeps.
    pub reap_interval_ms: u64,
    /// Bounded dequeue wait of each worker.
    pub dequeue_timeout_ms: u64,
    /// Prefix of worker ids.
    pub proc_name: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            target_worker_count: default_worker_count(),
            max_requests: 1000,
            max_requests_jitter: 100,
            worker_timeout_ms: 30_000,
            graceful_timeout_ms: 30_000,
            monitor_interval_ms: 100,
            reap_interval_ms: 5_000,
            dequeue_timeout_ms: 1_000,
            proc_name: "corral".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_timeout_ms == 0 {
            bail!("worker timeout must be positive");
        }
        if self.graceful_timeout_ms == 0 {
            bail!("graceful timeout must be positive");
        }
        if self.dequeue_timeout_ms >= self.worker_timeout_ms {
            bail!(
                "dequeue timeout ({}ms) must be shorter than the worker timeout ({}ms), \
                 or idle workers look hung",
                self.dequeue_timeout_ms,
                self.worker_timeout_ms
            );
        }
        if self.proc_name.is_empty() {
            bail!("proc_name must not be empty");
        }
        Ok(())
    }
}

/// How to change the pool size.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleRequest {
    /// Adjust the target by a signed delta, stopping at zero.
    By(i64),
    /// Set the target outright.
    To(usize),
}

impl ScaleRequest {
    pub fn apply(self, current: usize) -> usize {
        match self {
            ScaleRequest::By(delta) => {
                let next = current as i64 + delta;
                next.max(0) as usize
            }
            ScaleRequest::To(target) => target,
        }
    }
}

/// Control commands understood by the supervisor.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlIntent {
    /// Start a new worker generation and retire the old one once the new
    /// one is ready.
    Reload,
    /// Stop dequeuing, wait for in-flight jobs, then terminate. `None` uses
    /// the configured graceful timeout.
    GracefulShutdown { timeout: Option<Duration> },
    /// Terminate every worker without waiting.
    ImmediateShutdown,
    Scale(ScaleRequest),
}

/// Snapshot of the pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub target_worker_count: usize,
    pub reload_generation: u64,
    pub workers: Vec<WorkerSnapshot>,
}

impl SupervisorStatus {
    pub fn count_in(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    /// Idle plus busy workers across every generation.
    pub fn ready_count(&self) -> usize {
        self.workers.iter().filter(|w| w.state.is_ready()).count()
    }
}

#[derive(Debug, Default)]
struct SupervisorShared {
    target: AtomicUsize,
    generation: AtomicU64,
    workers: RwLock<Vec<Arc<WorkerShared>>>,
}

/// Cloneable control surface of a running supervisor.
///
/// When the last handle is dropped the supervisor shuts down gracefully.
#[derive(Clone)]
pub struct SupervisorHandle {
    intents: mpsc::Sender<ControlIntent>,
    shared: Arc<SupervisorShared>,
    events: SupervisorEventBus,
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("target_worker_count", &self.shared.target.load(Ordering::SeqCst))
            .field("reload_generation", &self.shared.generation.load(Ordering::SeqCst))
            .field("closed", &self.intents.is_closed())
            .finish()
    }
}

impl SupervisorHandle {
    pub async fn send(&self, intent: ControlIntent) -> anyhow::Result<()> {
        self.intents
            .send(intent)
            .await
            .context("supervisor is no longer running")
    }

    pub async fn reload(&self) -> anyhow::Result<()> {
        self.send(ControlIntent::Reload).await
    }

    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> anyhow::Result<()> {
        self.send(ControlIntent::GracefulShutdown { timeout }).await
    }

    pub async fn immediate_shutdown(&self) -> anyhow::Result<()> {
        self.send(ControlIntent::ImmediateShutdown).await
    }

    pub async fn scale(&self, request: ScaleRequest) -> anyhow::Result<()> {
        self.send(ControlIntent::Scale(request)).await
    }

    pub fn status(&self) -> SupervisorStatus {
        let workers = self.shared.workers.read();
        SupervisorStatus {
            target_worker_count: self.shared.target.load(Ordering::SeqCst),
            reload_generation: self.shared.generation.load(Ordering::SeqCst),
            workers: workers.iter().map(|w| w.snapshot()).collect(),
        }
    }

    /// Idle plus busy workers right now.
    pub fn available_capacity(&self) -> usize {
        self.shared
            .workers
            .read()
            .iter()
            .filter(|w| w.state().is_ready())
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}

/// Owns a pool of [`Worker`]s and keeps it at its target size.
///
/// The supervisor is a single control loop. It never executes jobs; it
/// spawns workers as tokio tasks, polls their shared state, and reacts to
/// [`ControlIntent`]s. It also runs the periodic started-job sweep.
pub struct Supervisor<S: JobStore> {
    config: SupervisorConfig,
    queue: Arc<TaskQueue<S>>,
    events: SupervisorEventBus,
}

impl<S: JobStore> fmt::Debug for Supervisor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

impl<S: JobStore> Supervisor<S> {
    pub fn new(config: SupervisorConfig, queue: Arc<TaskQueue<S>>) -> Self {
        Self {
            config,
            queue,
            events: SupervisorEventBus::default(),
        }
    }

    pub fn with_events(mut self, events: SupervisorEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<TaskQueue<S>> {
        Arc::clone(&self.queue)
    }

    /// Start the control loop on the current runtime.
    ///
    /// The join handle resolves once the pool has shut down.
    pub fn spawn(self) -> (SupervisorHandle, JoinHandle<anyhow::Result<()>>) {
        let (tx, rx) = mpsc::channel(32);
        let shared = Arc::new(SupervisorShared::default());
        shared
            .target
            .store(self.config.target_worker_count, Ordering::SeqCst);

        let handle = SupervisorHandle {
            intents: tx,
            shared: Arc::clone(&shared),
            events: self.events.clone(),
        };
        let pool = Pool {
            target: self.config.target_worker_count,
            config: self.config,
            queue: self.queue,
            events: self.events,
            shared,
            slots: Vec::new(),
            generation: 0,
            seq: 0,
            reloading: None,
            announced_ready: false,
        };
        let join = tokio::spawn(pool.run(rx));
        (handle, join)
    }
}

struct Slot {
    shared: Arc<WorkerShared>,
    handle: JoinHandle<WorkerExit>,
}

enum Shutdown {
    Graceful(Duration),
    Immediate,
}

/// State owned by the control loop.
struct Pool<S: JobStore> {
    config: SupervisorConfig,
    queue: Arc<TaskQueue<S>>,
    events: SupervisorEventBus,
    shared: Arc<SupervisorShared>,
    slots: Vec<Slot>,
    target: usize,
    generation: u64,
    seq: u64,
    /// Generation whose cohort is still coming up.
    reloading: Option<u64>,
    announced_ready: bool,
}

impl<S: JobStore> Pool<S> {
    async fn run(mut self, mut intents: mpsc::Receiver<ControlIntent>) -> anyhow::Result<()> {
        info!(
            target_worker_count = self.target,
            proc_name = %self.config.proc_name,
            "supervisor starting"
        );
        self.events.publish(SupervisorEvent::Starting {
            target_worker_count: self.target,
        });
        self.converge();

        let mut monitor = tokio::time::interval(self.config.monitor_interval());
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.reap_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => {
                        if let Some(shutdown) = self.apply(intent) {
                            break shutdown;
                        }
                    }
                    None => {
                        info!("all supervisor handles dropped, shutting down");
                        break Shutdown::Graceful(self.config.graceful_timeout());
                    }
                },
                _ = monitor.tick() => self.monitor().await,
                _ = sweep.tick() => self.sweep().await,
            }
        };

        self.shutdown(shutdown).await;
        Ok(())
    }

    fn apply(&mut self, intent: ControlIntent) -> Option<Shutdown> {
        debug!(?intent, "control intent received");
        match intent {
            ControlIntent::Reload => {
                self.generation += 1;
                self.shared.generation.store(self.generation, Ordering::SeqCst);
                self.reloading = Some(self.generation);
                info!(generation = self.generation, "reload started");
                self.events.publish(SupervisorEvent::ReloadStarted {
                    generation: self.generation,
                });
                self.converge();
                None
            }
            ControlIntent::Scale(request) => {
                let from = self.target;
                self.target = request.apply(from);
                self.shared.target.store(self.target, Ordering::SeqCst);
                info!(from, to = self.target, "scaling worker pool");
                self.events.publish(SupervisorEvent::Scaled {
                    from,
                    to: self.target,
                });
                self.converge();
                None
            }
            ControlIntent::GracefulShutdown { timeout } => Some(Shutdown::Graceful(
                timeout.unwrap_or_else(|| self.config.graceful_timeout()),
            )),
            ControlIntent::ImmediateShutdown => Some(Shutdown::Immediate),
        }
    }

    /// One health pass: collect exits, kill hung workers, advance a reload
    /// and converge on the target.
    async fn monitor(&mut self) {
        self.collect_exited().await;
        self.terminate_hung().await;
        self.advance_reload();
        self.converge();
        self.report_states();
    }

    async fn collect_exited(&mut self) {
        let mut index = 0;
        while index < self.slots.len() {
            if !self.slots[index].handle.is_finished() {
                index += 1;
                continue;
            }
            let Slot { shared, handle } = self.slots.swap_remove(index);
            let result = handle.await;
            self.record_exit(&shared, result).await;
        }
        self.publish_workers();
    }

    async fn record_exit(&mut self, worker: &Arc<WorkerShared>, result: Result<WorkerExit, JoinError>) {
        worker.mark_dead();
        let worker_id = worker.id().to_string();
        match result {
            Ok(WorkerExit::Stopped) => {
                info!(worker_id, "worker exited");
                telemetry::record_worker_exit(&worker_id, "stopped");
                self.events.publish(SupervisorEvent::WorkerExited { worker_id });
            }
            Ok(WorkerExit::Recycled { requests_handled }) => {
                info!(worker_id, requests_handled, "worker recycled");
                telemetry::record_worker_exit(&worker_id, "recycled");
                self.events.publish(SupervisorEvent::WorkerRecycled {
                    worker_id,
                    requests_handled,
                });
            }
            Err(err) => {
                let reason = if err.is_panic() {
                    "worker panicked".to_string()
                } else {
                    err.to_string()
                };
                error!(worker_id, reason, "worker crashed");
                telemetry::record_worker_exit(&worker_id, "crashed");
                self.abandon_current(worker).await;
                self.events
                    .publish(SupervisorEvent::WorkerCrashed { worker_id, reason });
            }
        }
    }

    async fn terminate_hung(&mut self) {
        let timeout = self.config.worker_timeout();
        let mut index = 0;
        while index < self.slots.len() {
            let silent_for = self.slots[index].shared.liveness().silent_for();
            if silent_for <= timeout || self.slots[index].handle.is_finished() {
                index += 1;
                continue;
            }
            let slot = self.slots.swap_remove(index);
            slot.handle.abort();
            slot.shared.mark_dead();
            let worker_id = slot.shared.id().to_string();
            warn!(
                worker_id,
                silent_ms = silent_for.as_millis() as u64,
                "worker missed its liveness deadline, terminating"
            );
            telemetry::record_worker_exit(&worker_id, "timed_out");
            self.abandon_current(&slot.shared).await;
            self.events
                .publish(SupervisorEvent::WorkerTimedOut { worker_id, silent_for });
        }
        self.publish_workers();
    }

    /// Release the job a dead worker was holding so it is retried without
    /// waiting for its timeout.
    async fn abandon_current(&self, worker: &WorkerShared) {
        let Some((job_id, lease_id)) = worker.current_job() else {
            return;
        };
        match self.queue.abandon(job_id, lease_id, worker.id()).await {
            Ok(outcome) => info!(%job_id, worker_id = worker.id(), ?outcome, "abandoned job released"),
            Err(err) => warn!(
                %job_id,
                worker_id = worker.id(),
                error = %err,
                "could not release abandoned job, it will be reaped"
            ),
        }
    }

    fn advance_reload(&mut self) {
        let Some(generation) = self.reloading else {
            return;
        };
        let ready = self
            .slots
            .iter()
            .filter(|s| s.shared.generation() == generation && s.shared.state().is_ready())
            .count();
        if ready < self.target {
            return;
        }
        for slot in self.slots.iter().filter(|s| s.shared.generation() < generation) {
            slot.shared.request_stop();
        }
        self.reloading = None;
        info!(generation, "reload completed, previous generation draining");
        self.events
            .publish(SupervisorEvent::ReloadCompleted { generation });
    }

    /// Spawn or stop current-generation workers until their count matches
    /// the target.
    fn converge(&mut self) {
        let generation = self.generation;
        let active: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.shared.generation() == generation && !s.shared.is_stop_requested())
            .map(|(i, _)| i)
            .collect();

        if active.len() < self.target {
            for _ in active.len()..self.target {
                self.spawn_worker();
            }
        } else if active.len() > self.target {
            // Idle first, then newest.
            let mut surplus = active;
            surplus.reverse();
            surplus.sort_by_key(|&i| self.slots[i].shared.state() != WorkerState::Idle);
            for &i in surplus.iter().take(surplus.len() - self.target) {
                debug!(worker_id = self.slots[i].shared.id(), "stopping surplus worker");
                self.slots[i].shared.request_stop();
            }
        }

        if !self.announced_ready && self.reloading.is_none() {
            let ready = self.slots.iter().filter(|s| s.shared.state().is_ready()).count();
            if ready >= self.target {
                self.announced_ready = true;
                info!(workers = ready, "worker pool ready");
                self.events.publish(SupervisorEvent::Ready {
                    target_worker_count: self.target,
                });
            }
        }
        self.publish_workers();
    }

    fn spawn_worker(&mut self) {
        let worker_id = format!(
            "{}-{}-g{}-w{}",
            self.config.proc_name,
            std::process::id(),
            self.generation,
            self.seq
        );
        self.seq += 1;
        let max_requests = self.jittered_max_requests();
        let config = WorkerConfig::new(worker_id.clone())
            .with_generation(self.generation)
            .with_dequeue_timeout(self.config.dequeue_timeout_ms)
            .with_max_requests(max_requests);

        let worker = Worker::new(config, Arc::clone(&self.queue));
        let shared = worker.shared();
        let handle = tokio::spawn(worker.run());
        self.slots.push(Slot { shared, handle });

        debug!(worker_id, generation = self.generation, max_requests, "worker spawned");
        self.events.publish(SupervisorEvent::WorkerSpawned {
            worker_id,
            generation: self.generation,
            max_requests,
        });
    }

    fn jittered_max_requests(&self) -> u64 {
        let base = self.config.max_requests;
        if base == 0 {
            return 0;
        }
        base + rand::rng().random_range(0..=self.config.max_requests_jitter)
    }

    async fn sweep(&mut self) {
        match self.queue.reap_expired().await {
            Ok(_) => {}
            Err(err) if err.is_transient() => telemetry::record_store_unavailable("reap", &err),
            Err(err) => warn!(error = %err, "started-job sweep failed"),
        }
        if let Err(err) = self.queue.snapshot().await {
            debug!(error = %err, "queue snapshot failed");
        }
    }

    async fn shutdown(&mut self, mode: Shutdown) {
        let graceful = matches!(mode, Shutdown::Graceful(_));
        info!(graceful, workers = self.slots.len(), "supervisor shutting down");
        self.events
            .publish(SupervisorEvent::ShutdownStarted { graceful });

        for slot in &self.slots {
            slot.shared.request_stop();
        }
        self.publish_workers();

        if let Shutdown::Graceful(timeout) = mode {
            let deadline = Instant::now() + timeout;
            loop {
                self.collect_exited().await;
                if self.slots.is_empty() || Instant::now() >= deadline {
                    break;
                }
                let wait = (deadline - Instant::now()).min(self.config.monitor_interval());
                tokio::time::sleep(wait).await;
            }
        }

        let forced_workers = self.slots.len();
        for slot in std::mem::take(&mut self.slots) {
            slot.handle.abort();
            slot.shared.mark_dead();
            warn!(worker_id = slot.shared.id(), "terminating worker");
            telemetry::record_worker_exit(slot.shared.id(), "killed");
            self.abandon_current(&slot.shared).await;
        }
        self.publish_workers();
        self.report_states();

        info!(forced_workers, "supervisor stopped");
        self.events
            .publish(SupervisorEvent::ShutdownCompleted { forced_workers });
    }

    fn publish_workers(&self) {
        *self.shared.workers.write() = self.slots.iter().map(|s| Arc::clone(&s.shared)).collect();
    }

    fn report_states(&self) {
        for state in [
            WorkerState::Starting,
            WorkerState::Idle,
            WorkerState::Busy,
            WorkerState::Stopping,
        ] {
            let count = self
                .slots
                .iter()
                .filter(|s| s.shared.state() == state)
                .count();
            telemetry::set_worker_count(state.as_str(), count);
        }
    }
}
