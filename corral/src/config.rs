use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::health::NodeId;
use crate::job::DEFAULT_QUEUE;
use crate::lease::RetryPolicy;
use crate::runtime::SupervisorConfig;

/// Configuration for queue behavior and retry policies.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Named queues in dequeue priority order. Each queue is FIFO.
    pub queues: Vec<String>,
    /// Backoff applied between failed attempts.
    pub retry: RetryPolicy,
    /// How often a waiting `dequeue` re-checks the store, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum scheduled jobs promoted per queue per dequeue pass.
    pub promote_batch_size: usize,
    /// Maximum stale jobs reaped per queue per sweep.
    pub reap_batch_size: usize,
    /// Compare-and-swap attempts before an update reports contention.
    pub cas_attempts: u32,
    /// How many times a job may be requeued after its worker was lost or
    /// it was reaped. These recoveries do not use up `max_retries`.
    /// `None` requeues without limit.
    pub max_recoveries: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            retry: RetryPolicy::default(),
            poll_interval_ms: 50,
            promote_batch_size: 100,
            reap_batch_size: 100,
            cas_attempts: 16,
            max_recoveries: None,
        }
    }
}

impl QueueConfig {
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_recoveries(mut self, max: u32) -> Self {
        self.max_recoveries = Some(max);
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queues.is_empty() {
            bail!("at least one queue must be configured");
        }
        for (i, name) in self.queues.iter().enumerate() {
            if name.is_empty() || name.contains(':') {
                bail!("invalid queue name {name:?}");
            }
            if self.queues[..i].contains(name) {
                bail!("queue {name:?} listed twice");
            }
        }
        if self.cas_attempts == 0 {
            bail!("cas_attempts must be at least 1");
        }
        Ok(())
    }
}

/// Where the job store lives and how keys are namespaced.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection string (e.g., "redis://127.0.0.1:6379").
    pub redis_url: String,
    /// Prefix shared by every key corral writes.
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "corral".to_string(),
        }
    }
}

/// Heartbeat publication and aggregation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Lifetime of a heartbeat record; a node that stops publishing drops
    /// out of the healthy set once this elapses.
    pub heartbeat_ttl_secs: u64,
    /// Interval between heartbeats. Must be shorter than the TTL.
    pub publish_interval_secs: u64,
    /// How long a silent node still counts towards `total_count`.
    pub membership_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: 30,
            publish_interval_secs: 10,
            membership_window_secs: 3600,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs.max(1))
    }

    pub fn membership_window(&self) -> Duration {
        Duration::from_secs(self.membership_window_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_ttl_secs == 0 {
            bail!("heartbeat TTL must be positive");
        }
        if self.publish_interval_secs >= self.heartbeat_ttl_secs {
            bail!(
                "heartbeat interval ({}s) must be shorter than its TTL ({}s)",
                self.publish_interval_secs,
                self.heartbeat_ttl_secs
            );
        }
        Ok(())
    }
}

/// Full node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    pub node_id: String,
    pub queue: QueueConfig,
    pub supervisor: SupervisorConfig,
    pub health: HealthConfig,
    pub store: StoreConfig,
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(None),
            queue: QueueConfig::default(),
            supervisor: SupervisorConfig::default(),
            health: HealthConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

fn default_node_id(hostname: Option<String>) -> String {
    hostname
        .filter(|h| h.parse::<NodeId>().is_ok())
        .unwrap_or_else(|| format!("corral-{}", std::process::id()))
}

/// Number of workers used when `WORKERS` is unset or zero: `2 * cpus + 1`.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    cpus * 2 + 1
}

impl CorralConfig {
    /// Load from the process environment. See [`CorralConfig::from_lookup`].
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from `lookup`, starting from defaults and
    /// overriding every variable that is present. Malformed values are
    /// errors, never silently replaced by defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            node_id: default_node_id(lookup("HOSTNAME")),
            ..Self::default()
        };

        if let Some(node_id) = lookup("NODE_ID") {
            config.node_id = node_id;
        }

        let supervisor = &mut config.supervisor;
        if let Some(workers) = parse_var::<usize, _>(&lookup, "WORKERS")? {
            supervisor.target_worker_count = if workers > 0 {
                workers
            } else {
                default_worker_count()
            };
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "WORKER_TIMEOUT")? {
            supervisor.worker_timeout_ms = secs * 1000;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "GRACEFUL_TIMEOUT")? {
            supervisor.graceful_timeout_ms = secs * 1000;
        }
        if let Some(max) = parse_var(&lookup, "MAX_REQUESTS")? {
            supervisor.max_requests = max;
        }
        if let Some(jitter) = parse_var(&lookup, "MAX_REQUESTS_JITTER")? {
            supervisor.max_requests_jitter = jitter;
        }
        if let Some(name) = lookup("PROC_NAME") {
            supervisor.proc_name = name;
        }

        if let Some(queues) = lookup("QUEUES") {
            config.queue.queues = queues
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ms) = parse_var(&lookup, "RETRY_BASE_DELAY_MS")? {
            config.queue.retry.base_delay_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "RETRY_MAX_DELAY_MS")? {
            config.queue.retry.max_backoff_ms = ms;
        }
        if let Some(max) = parse_var(&lookup, "MAX_RECOVERIES")? {
            config.queue.max_recoveries = Some(max);
        }

        if let Some(url) = lookup("REDIS_URL") {
            config.store.redis_url = url;
        }
        if let Some(namespace) = lookup("KEY_NAMESPACE") {
            config.store.namespace = namespace;
        }

        if let Some(ttl) = parse_var(&lookup, "HEARTBEAT_TTL")? {
            config.health.heartbeat_ttl_secs = ttl;
        }
        if let Some(interval) = parse_var(&lookup, "HEARTBEAT_INTERVAL")? {
            config.health.publish_interval_secs = interval;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.node_id
            .parse::<NodeId>()
            .with_context(|| format!("invalid node id {:?}", self.node_id))?;
        self.queue.validate().context("invalid queue configuration")?;
        self.supervisor
            .validate()
            .context("invalid supervisor configuration")?;
        self.health.validate().context("invalid health configuration")?;
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{name}={raw:?}: {e}")),
    }
}
